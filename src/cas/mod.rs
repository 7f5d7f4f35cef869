//! Conditional Access System adapters.
//!
//! Each CAS family implements the four-predicate [`CasAdapter`] contract;
//! [`init_cas`] walks the registry and constructs the adapter claiming the
//! instance CAID.

pub mod irdeto;

use crate::psi::CaDescriptor;

/// Everything a CAS adapter may need from the decrypt instance and its CAM.
#[derive(Clone)]
pub struct CasEnv {
    pub caid: u16,
    pub pnr: u16,
    /// Raw `cas_data` option bytes, zero-padded.
    pub cas_data: [u8; 32],
    /// Card unique address.
    pub ua: [u8; 8],
    /// Shared address of the first provider entry.
    pub sa: [u8; 8],
    /// False when the CAM supplied no addresses (EMM matching disabled).
    pub addr_set: bool,
}

pub trait CasAdapter: Send {
    /// Initial CA-descriptor acceptance; may mutate adapter state.
    fn check_descriptor(&mut self, desc: &CaDescriptor) -> bool;
    /// Decide whether this ECM/EMM section goes to the CAM. For ECMs the
    /// adapter suppresses repeats of the same parity unless `force` is set;
    /// for EMMs it accepts only our UA/SA.
    fn check_em(&mut self, section: &[u8], force: bool) -> bool;
    /// Validate that a key response belongs to the selected channel.
    fn check_keys(&mut self, response: &[u8]) -> bool;
}

pub struct CasEntry {
    pub name: &'static str,
    pub check_caid: fn(u16) -> bool,
    pub init: fn(&CasEnv) -> Box<dyn CasAdapter>,
}

pub const CAS_LIST: &[CasEntry] = &[CasEntry {
    name: "Irdeto",
    check_caid: irdeto::check_caid,
    init: irdeto::init,
}];

/// Returns the first registered adapter handling `env.caid`.
pub fn init_cas(env: &CasEnv) -> Option<(&'static str, Box<dyn CasAdapter>)> {
    CAS_LIST
        .iter()
        .find(|e| (e.check_caid)(env.caid))
        .map(|e| (e.name, (e.init)(env)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(caid: u16) -> CasEnv {
        CasEnv {
            caid,
            pnr: 1,
            cas_data: [0; 32],
            ua: [0; 8],
            sa: [0; 8],
            addr_set: false,
        }
    }

    #[test]
    fn registry_matches_irdeto_range() {
        assert!(init_cas(&env(0x0624)).is_some());
        assert!(init_cas(&env(0x1702)).is_some());
        assert!(init_cas(&env(0x0500)).is_none());
    }
}
