// src/lib.rs
pub mod descrambler {
    //! Public surface of the MPEG-TS conditional-access descrambler.

    pub use crate::cam::{CamClient, CamEvent, CamHandle, CamProvider};
    pub use crate::csa::{BatchCipher, Parity};
    pub use crate::decrypt::Decryptor;
    pub use crate::report::{DescramblerReport, Reporter};
    pub use crate::types::{Options, OutputOptions, PacketSink};

    /// Async entry-point; returns when stopped (Ctrl-C or socket error)
    pub async fn run(opts: Options) -> anyhow::Result<()> {
        crate::core::run(opts).await
    }
}

mod cam;
mod cas;
mod constants;
mod core;
mod csa;
mod decrypt;
mod network;
mod output;
mod packet;
mod psi;
mod report;
mod ring;
mod types;
