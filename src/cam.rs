//! CAM client contract consumed by the decryptor.
//!
//! The CAM itself (CCcam, newcamd, ...) lives outside this crate. It
//! presents a [`CamClient`] for submissions and pushes [`CamEvent`]s onto
//! an unbounded channel that the ingest loop multiplexes with the UDP
//! socket; the decryptor never blocks waiting for keys.

use std::sync::Arc;

use tokio::sync::mpsc;

/// One provider entry: 4-byte ident plus the shared address.
#[derive(Clone, Debug)]
pub struct CamProvider {
    pub id: [u8; 4],
    pub sa: [u8; 8],
}

pub trait CamClient: Send + Sync {
    fn is_ready(&self) -> bool;
    fn caid(&self) -> u16;
    fn ua(&self) -> [u8; 8];
    fn providers(&self) -> Vec<CamProvider>;
    fn disable_emm(&self) -> bool;
    /// Enqueue an entitlement message; the answer arrives later as
    /// [`CamEvent::Response`].
    fn send_em(&self, section: &[u8]);
}

/// Lifecycle and response events delivered on the ingest thread.
#[derive(Debug)]
pub enum CamEvent {
    Ready,
    Error,
    Response {
        data: Vec<u8>,
        errmsg: Option<String>,
    },
}

/// Pairing of a CAM with its event stream, handed over via `Options::cam`.
pub struct CamHandle {
    pub client: Arc<dyn CamClient>,
    pub events: mpsc::UnboundedReceiver<CamEvent>,
}

impl CamHandle {
    pub fn new(client: Arc<dyn CamClient>, events: mpsc::UnboundedReceiver<CamEvent>) -> Self {
        Self { client, events }
    }
}
