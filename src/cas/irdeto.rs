//! Irdeto CAS adapter.
//!
//! ECM layout: parity in byte 0 (table_id 0x80/0x81), ecm_id at byte 4,
//! CHID big-endian at bytes 6..8. The CHID is either preselected through
//! `cas_data` or auto-selected: candidate ECMs are forwarded one at a time
//! and the CHID under test is committed on the first good key response.

use log::info;

use crate::cas::{CasAdapter, CasEnv};
use crate::psi::CaDescriptor;

const ECM_MAX_ID: usize = 16;
const CHID_AUTO: u16 = 0xFFFF;

struct Irdeto {
    pnr: u16,
    parity: u8,
    chid: u16,

    // chid auto-select
    test_checking: bool,
    test_current: usize,
    ecm_id: [(u8, u16); ECM_MAX_ID], // parity, chid per ecm_id

    ua: [u8; 8],
    sa: [u8; 8],
    addr_set: bool,
}

pub fn check_caid(caid: u16) -> bool {
    ((caid & 0xFF00) == 0x0600) || (caid == 0x1702)
}

pub fn init(env: &CasEnv) -> Box<dyn CasAdapter> {
    let chid = if env.cas_data[1] != 0 {
        ((env.cas_data[0] as u16) << 8) | env.cas_data[1] as u16
    } else {
        CHID_AUTO
    };
    Box::new(Irdeto {
        pnr: env.pnr,
        parity: 0,
        chid,
        test_checking: false,
        test_current: 0,
        ecm_id: [(0, 0); ECM_MAX_ID],
        ua: env.ua,
        sa: env.sa,
        addr_set: env.addr_set,
    })
}

fn ecm_chid(payload: &[u8]) -> u16 {
    ((payload[6] as u16) << 8) | payload[7] as u16
}

impl Irdeto {
    fn check_ecm(&mut self, payload: &[u8], force: bool) -> bool {
        if payload.len() < 8 {
            return false;
        }
        let parity = payload[0];
        if !force && parity == self.parity {
            return false;
        }

        let chid = ecm_chid(payload);
        if self.chid != CHID_AUTO {
            if self.chid != chid {
                return false;
            }
            self.parity = parity;
            return true;
        }

        // autoselect: one candidate in flight at a time
        if self.test_checking {
            return false;
        }
        let ecm_id = payload[4] as usize;
        if ecm_id >= ECM_MAX_ID {
            return false;
        }
        if self.ecm_id[ecm_id].0 == parity {
            return false;
        }
        self.test_checking = true;
        self.test_current = ecm_id;
        self.ecm_id[ecm_id] = (parity, chid);
        true
    }

    fn check_emm(&self, section: &[u8]) -> bool {
        if !self.addr_set || section.len() < 4 {
            return false;
        }
        let emm_len = (section[3] & 0x07) as usize;
        let emm_base = section[3] >> 3;
        let a: &[u8; 8] = if emm_base & 0x10 != 0 {
            &self.ua // check card
        } else {
            &self.sa // check provider
        };
        if emm_base != a[4] {
            return false;
        }
        if emm_len == 0 {
            return true;
        }
        if 5 + emm_len > a.len() || section.len() < 4 + emm_len {
            return false;
        }
        section[4..4 + emm_len] == a[5..5 + emm_len]
    }
}

impl CasAdapter for Irdeto {
    fn check_descriptor(&mut self, _desc: &CaDescriptor) -> bool {
        true
    }

    fn check_em(&mut self, section: &[u8], force: bool) -> bool {
        match section[0] {
            0x80 | 0x81 => self.check_ecm(section, force),
            _ => self.check_emm(section),
        }
    }

    fn check_keys(&mut self, response: &[u8]) -> bool {
        if response[2] == 0 {
            if self.chid == CHID_AUTO {
                self.test_checking = false;
            }
            return false;
        }

        if self.chid == CHID_AUTO {
            // commit the chid currently under test
            self.chid = self.ecm_id[self.test_current].1;
            self.parity = response[0];
            info!("[cas Irdeto PNR:{}] select chid:0x{:04X}", self.pnr, self.chid);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> CasEnv {
        CasEnv {
            caid: 0x0624,
            pnr: 1,
            cas_data: [0; 32],
            ua: [0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44],
            sa: [0, 0, 0, 0, 0x03, 0xAA, 0xBB, 0xCC],
            addr_set: true,
        }
    }

    fn ecm(parity: u8, ecm_id: u8, chid: u16) -> Vec<u8> {
        let mut s = vec![parity, 0x70, 0x10, 0x00];
        s.push(ecm_id);
        s.push(0x00);
        s.extend_from_slice(&chid.to_be_bytes());
        s.extend(std::iter::repeat(0).take(8));
        s
    }

    #[test]
    fn parity_dedup_and_force() {
        let mut env = env();
        env.cas_data[0] = 0x12;
        env.cas_data[1] = 0x34; // preselect chid 0x1234
        let mut cas = init(&env);

        assert!(cas.check_em(&ecm(0x80, 0, 0x1234), false));
        // same parity suppressed until forced
        assert!(!cas.check_em(&ecm(0x80, 0, 0x1234), false));
        assert!(cas.check_em(&ecm(0x80, 0, 0x1234), true));
        // parity flip accepted
        assert!(cas.check_em(&ecm(0x81, 0, 0x1234), false));
        // wrong chid never forwarded
        assert!(!cas.check_em(&ecm(0x80, 0, 0x9999), false));
    }

    #[test]
    fn chid_autoselect_commits_on_first_key() {
        let mut cas = init(&env());

        assert!(cas.check_em(&ecm(0x80, 2, 0x0BB8), false));
        // candidate in flight: nothing else goes out
        assert!(!cas.check_em(&ecm(0x81, 3, 0x0BB9), false));

        // CAM answered without keys: candidate rejected, try the next
        assert!(!cas.check_keys(&[0x80, 0x00, 0x00]));
        assert!(cas.check_em(&ecm(0x81, 3, 0x0BB9), false));

        // good response commits chid 0x0BB9
        assert!(cas.check_keys(&[0x81, 0x00, 0x10]));
        assert!(!cas.check_em(&ecm(0x80, 2, 0x0BB8), false));
        assert!(cas.check_em(&ecm(0x80, 3, 0x0BB9), false));
    }

    #[test]
    fn emm_addressing() {
        let mut cas = init(&env());

        // UA match: base 0x11 (bit 4 set selects the card), suffix from ua[5..]
        let mut emm = vec![0x82, 0x70, 0x20, (0x11 << 3) | 0x02, 0x22, 0x33];
        assert!(cas.check_em(&emm, false));
        emm[4] = 0x99; // suffix mismatch
        assert!(!cas.check_em(&emm, false));

        // SA match: base 0x03, one suffix byte
        let emm = vec![0x82, 0x70, 0x20, (0x03 << 3) | 0x01, 0xAA];
        assert!(cas.check_em(&emm, false));
        // zero-length match on base only
        let emm = vec![0x82, 0x70, 0x20, 0x03 << 3];
        assert!(cas.check_em(&emm, false));
    }
}
