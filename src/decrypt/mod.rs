//! Decryptor core: PID routing, PSI table handlers, CAS/CAM glue, key
//! rollover and clustered batch descrambling.
//!
//! One `Decryptor` serves one program of the multiplex. The ingest task
//! feeds it 188-byte packets; tables are consumed (only the rewritten PMT
//! goes downstream), foreign CA PIDs are dropped, everything else is
//! passed through until keys arrive and decrypted in clusters afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::cam::{CamClient, CamEvent};
use crate::cas::{init_cas, CasAdapter, CasEnv};
use crate::constants::{CAM_RESPONSE_SIZE, EM_MAX_SIZE, MAX_PID, NULL_TS_PID, TS_PACKET_SIZE};
use crate::csa::{cipher_for_algo, BatchCipher, Parity};
use crate::packet::{self, Scrambling};
use crate::psi::section::{crc32_calc, crc32_stored};
use crate::psi::{parse_cat, parse_pat, parse_pmt, rewrite_pmt, send_section, CaDescriptor, PsiBuffer};
use crate::types::{Options, PacketSink};

const BISS_CAID: u16 = 0x2600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PidKind {
    Unknown,
    Pat,
    Cat,
    Pmt,
    Ecm,
    Emm,
    /// Conditional access of a foreign system, or a deselected ECM backup.
    Ca,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKey {
    None,
    Even,
    Odd,
}

/// Running totals surfaced by the status report.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub packets: u64,
    pub scrambled: u64,
    pub em_sent: u64,
    pub key_errors: u64,
}

pub struct Decryptor {
    name: String,
    caid: u16,
    pnr: u16,
    pmt_pid: u16,

    forced_ecm_pid: u16,
    ecm_swap_time: u64,
    reload_delay: u32,

    stream: Box<[PidKind]>, // flat table indexed by PID

    pat: PsiBuffer,
    cat: PsiBuffer,
    pmt: PsiBuffer,
    em: HashMap<u16, PsiBuffer>,

    custom_pmt: Vec<u8>,
    pmt_cc: u8,

    cam: Option<Arc<dyn CamClient>>,
    cas: Option<Box<dyn CasAdapter>>,
    cas_data: [u8; 32],

    ecm_candidates: Vec<u16>,
    ecm_pid_fails: u32,
    ecm_pid_delay: Option<Instant>,
    force: bool,

    cipher: Box<dyn BatchCipher>,
    is_keys: bool,
    new_key: [u8; 16],
    pending: PendingKey,

    cluster_bytes: usize,
    buffer: Vec<u8>, // two cluster halves
    fill_half: usize,
    skip: usize,

    pub counters: Counters,
}

impl Decryptor {
    pub fn new(opts: &Options, cam: Option<Arc<dyn CamClient>>) -> anyhow::Result<Self> {
        Self::with_cipher(opts, cam, cipher_for_algo(opts.algo))
    }

    pub fn with_cipher(
        opts: &Options,
        cam: Option<Arc<dyn CamClient>>,
        cipher: Box<dyn BatchCipher>,
    ) -> anyhow::Result<Self> {
        if opts.name.is_empty() {
            anyhow::bail!("[decrypt] option 'name' is required");
        }

        let mut cas_data = [0u8; 32];
        if let Some(value) = &opts.cas_data {
            let bytes = hex::decode(value)
                .map_err(|e| anyhow::anyhow!("[decrypt {}] bad cas_data: {}", opts.name, e))?;
            if bytes.len() > cas_data.len() {
                anyhow::bail!("[decrypt {}] cas_data is too long", opts.name);
            }
            cas_data[..bytes.len()].copy_from_slice(&bytes);
        }

        let cluster_bytes = cipher.batch_size() * TS_PACKET_SIZE;
        let mut dec = Self {
            name: opts.name.clone(),
            caid: 0,
            pnr: 0,
            pmt_pid: 0,
            forced_ecm_pid: opts.ecm_pid,
            ecm_swap_time: opts.ecm_swap_time,
            reload_delay: opts.reload_delay,
            stream: vec![PidKind::Unknown; MAX_PID].into_boxed_slice(),
            pat: PsiBuffer::new(),
            cat: PsiBuffer::new(),
            pmt: PsiBuffer::new(),
            em: HashMap::new(),
            custom_pmt: Vec::new(),
            pmt_cc: 0,
            cam: None,
            cas: None,
            cas_data,
            ecm_candidates: Vec::new(),
            ecm_pid_fails: 0,
            ecm_pid_delay: None,
            force: false,
            cipher,
            is_keys: false,
            new_key: [0; 16],
            pending: PendingKey::None,
            cluster_bytes,
            buffer: vec![0u8; cluster_bytes * 2],
            fill_half: 0,
            skip: 0,
            counters: Counters::default(),
        };

        if let Some(biss) = &opts.biss {
            if biss.len() != 16 {
                anyhow::bail!("[decrypt {}] biss key must be 16 chars length", opts.name);
            }
            let mut key = [0u8; 8];
            hex::decode_to_slice(biss, &mut key)
                .map_err(|e| anyhow::anyhow!("[decrypt {}] bad biss key: {}", opts.name, e))?;
            key[3] = key[0].wrapping_add(key[1]).wrapping_add(key[2]);
            key[7] = key[4].wrapping_add(key[5]).wrapping_add(key[6]);
            dec.cipher.set_control_word(Parity::Even, &key);
            dec.cipher.set_control_word(Parity::Odd, &key);
            dec.new_key[..8].copy_from_slice(&key);
            dec.new_key[8..].copy_from_slice(&key);
            dec.is_keys = true;
            dec.caid = BISS_CAID;
        } else if let Some(cam) = cam {
            if cam.is_ready() {
                dec.caid = cam.caid();
            }
            dec.cam = Some(cam);
        }

        dec.stream_reload();
        Ok(dec)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caid(&self) -> u16 {
        self.caid
    }

    pub fn pnr(&self) -> u16 {
        self.pnr
    }

    pub fn pmt_pid(&self) -> u16 {
        self.pmt_pid
    }

    pub fn keys_set(&self) -> bool {
        self.is_keys
    }

    pub fn ecm_pid_fails(&self) -> u32 {
        self.ecm_pid_fails
    }

    /// Currently selected ECM PID, if any.
    pub fn ecm_pid(&self) -> Option<u16> {
        self.stream
            .iter()
            .position(|&k| k == PidKind::Ecm)
            .map(|p| p as u16)
    }

    fn stream_reload(&mut self) {
        self.stream.fill(PidKind::Unknown);
        self.stream[0] = PidKind::Pat;
        self.stream[1] = PidKind::Cat;

        self.pat.reset();
        self.cat.reset();
        self.pmt.reset();
        self.em.clear();
        self.custom_pmt.clear();
        self.ecm_candidates.clear();

        self.force = false;
        self.cas = None;
    }

    /// Feeds one input TS packet; decrypted output goes to `sink`.
    pub fn on_ts(&mut self, ts: &[u8], sink: &mut dyn PacketSink) -> anyhow::Result<()> {
        self.counters.packets += 1;
        let pid = packet::pid(ts);

        match self.stream[pid as usize] {
            PidKind::Pat => {
                if self.pat.ingest(ts) {
                    let section = self.pat.section().to_vec();
                    self.on_pat(&section)?;
                }
                return Ok(());
            }
            PidKind::Cat => {
                if self.cat.ingest(ts) {
                    let section = self.cat.section().to_vec();
                    self.on_cat(&section);
                }
                return Ok(());
            }
            PidKind::Pmt => {
                if self.pmt.ingest(ts) {
                    let section = self.pmt.section().to_vec();
                    self.on_pmt(&section, sink);
                }
                return Ok(());
            }
            PidKind::Ecm | PidKind::Emm => {
                if self.cas.is_some() {
                    let buf = self.em.entry(pid).or_default();
                    if buf.ingest(ts) {
                        let section = buf.section().to_vec();
                        self.on_em(&section);
                    }
                }
                return Ok(());
            }
            PidKind::Ca => return Ok(()), // foreign system, dropped
            PidKind::Unknown => {}
        }

        if packet::scrambling_control(ts) != Scrambling::Clear {
            self.counters.scrambled += 1;
        }

        if !self.is_keys {
            sink.send(ts);
            return Ok(());
        }

        let base = self.fill_half + self.skip;
        self.buffer[base..base + TS_PACKET_SIZE].copy_from_slice(ts);
        self.skip += TS_PACKET_SIZE;
        if self.skip >= self.cluster_bytes {
            self.decrypt_cluster(sink);
        }
        Ok(())
    }

    /// Drains a partially filled cluster (teardown or test boundaries).
    pub fn flush(&mut self, sink: &mut dyn PacketSink) {
        if self.skip > 0 {
            self.decrypt_cluster(sink);
        }
    }

    fn decrypt_cluster(&mut self, sink: &mut dyn PacketSink) {
        let filled = self.skip;
        let cluster = &mut self.buffer[self.fill_half..self.fill_half + filled];

        let mut even: Vec<(usize, usize)> = Vec::with_capacity(filled / TS_PACKET_SIZE);
        let mut odd: Vec<(usize, usize)> = Vec::with_capacity(filled / TS_PACKET_SIZE);
        for off in (0..filled).step_by(TS_PACKET_SIZE) {
            let ts = &mut cluster[off..off + TS_PACKET_SIZE];
            let parity = match packet::scrambling_control(ts) {
                Scrambling::Clear | Scrambling::Reserved => continue,
                Scrambling::Even => Parity::Even,
                Scrambling::Odd => Parity::Odd,
            };
            packet::clear_scrambling(ts);

            let payload = packet::payload_offset(ts);
            if payload >= TS_PACKET_SIZE {
                continue;
            }
            let len = TS_PACKET_SIZE - payload;
            if len < 8 {
                continue; // shorter than one cipher block
            }
            match parity {
                Parity::Even => even.push((off + payload, len)),
                Parity::Odd => odd.push((off + payload, len)),
            }
        }
        if !even.is_empty() {
            self.cipher.decrypt_batch(Parity::Even, cluster, &even);
        }
        if !odd.is_empty() {
            self.cipher.decrypt_batch(Parity::Odd, cluster, &odd);
        }

        // scheduled key install, never inside a cluster
        match self.pending {
            PendingKey::Even => {
                let mut cw = [0u8; 8];
                cw.copy_from_slice(&self.new_key[..8]);
                self.cipher.set_control_word(Parity::Even, &cw);
            }
            PendingKey::Odd => {
                let mut cw = [0u8; 8];
                cw.copy_from_slice(&self.new_key[8..]);
                self.cipher.set_control_word(Parity::Odd, &cw);
            }
            PendingKey::None => {}
        }
        self.pending = PendingKey::None;

        for off in (0..filled).step_by(TS_PACKET_SIZE) {
            let base = self.fill_half + off;
            sink.send(&self.buffer[base..base + TS_PACKET_SIZE]);
        }

        self.fill_half = self.cluster_bytes - self.fill_half;
        self.skip = 0;
    }

    /*
     * PAT
     */

    fn on_pat(&mut self, section: &[u8]) -> anyhow::Result<()> {
        let crc32 = crc32_stored(section);
        if crc32 == self.pat.crc32 {
            return Ok(()); // repeat
        }
        if crc32 != crc32_calc(section) {
            error!("[decrypt {}] PAT checksum mismatch", self.name);
            return Ok(());
        }
        if self.pat.crc32 != 0 {
            warn!("[decrypt {}] PAT changed. Reload stream info", self.name);
            self.stream_reload();
        }
        self.pat.crc32 = crc32;

        let pat = match parse_pat(section) {
            Ok(pat) => pat,
            Err(e) => {
                error!("[decrypt {}] bad PAT: {}", self.name, e);
                return Ok(());
            }
        };
        if let Some(entry) = pat.programs.first() {
            self.pnr = entry.program_number;
            self.pmt_pid = entry.pmt_pid;
            self.stream[entry.pmt_pid as usize] = PidKind::Pmt;
        }

        let cam_ready = self.cam.clone().filter(|c| c.is_ready());
        if let Some(cam) = cam_ready {
            let providers = cam.providers();
            let env = CasEnv {
                caid: self.caid,
                pnr: self.pnr,
                cas_data: self.cas_data,
                ua: cam.ua(),
                sa: providers.first().map(|p| p.sa).unwrap_or([0; 8]),
                addr_set: true,
            };
            match init_cas(&env) {
                Some((_, cas)) => self.cas = Some(cas),
                None => anyhow::bail!(
                    "[decrypt {}] CAS with CAID:0x{:04X} not found",
                    self.name,
                    self.caid
                ),
            }

            self.cat.crc32 = 0;
            self.pmt.crc32 = 0;
            for kind in self.stream.iter_mut() {
                if *kind == PidKind::Ca {
                    *kind = PidKind::Unknown;
                }
            }
        }
        Ok(())
    }

    /*
     * CAT
     */

    fn on_cat(&mut self, section: &[u8]) {
        let crc32 = crc32_stored(section);
        if crc32 == self.cat.crc32 {
            self.cat.reload_counter = 0;
            return;
        }
        if crc32 != crc32_calc(section) {
            error!("[decrypt {}] CAT checksum mismatch", self.name);
            return;
        }
        if self.cat.crc32 != 0 {
            // debounce against transient broadcast jitter
            self.cat.reload_counter += 1;
            if self.cat.reload_counter >= self.reload_delay {
                warn!("[decrypt {}] CAT changed. Reload stream info", self.name);
                self.stream_reload();
            }
            return;
        }
        self.cat.crc32 = crc32;

        let cat = match parse_cat(section) {
            Ok(cat) => cat,
            Err(e) => {
                error!("[decrypt {}] bad CAT: {}", self.name, e);
                return;
            }
        };

        let disable_emm = self.cam.as_ref().map(|c| c.disable_emm()).unwrap_or(true);
        let mut is_emm_selected = self.cas.is_some() && disable_emm;

        for ca in cat.descriptors.iter().filter_map(|d| d.as_ca()) {
            let pid = ca.pid as usize;
            if self.stream[pid] == PidKind::Ca {
                self.stream[pid] = PidKind::Unknown;
            }
            if ca.pid == NULL_TS_PID || self.stream[pid] != PidKind::Unknown {
                continue;
            }
            if self.cas.is_some() && !disable_emm && ca.caid == self.caid {
                self.stream[pid] = PidKind::Emm;
                info!("[decrypt {}] Select EMM pid:{}", self.name, ca.pid);
                is_emm_selected = true;
            } else {
                self.stream[pid] = PidKind::Ca;
            }
        }

        if self.cas.is_some() && !is_emm_selected {
            error!("[decrypt {}] EMM is not found", self.name);
        }
    }

    /*
     * PMT
     */

    fn on_pmt(&mut self, section: &[u8], sink: &mut dyn PacketSink) {
        if section.len() < 12 {
            return;
        }
        let pnr = u16::from_be_bytes([section[3], section[4]]);
        if pnr != self.pnr {
            return;
        }

        let crc32 = crc32_stored(section);
        if crc32 == self.pmt.crc32 {
            self.send_custom_pmt(sink); // repeat of the accepted PMT
            return;
        }
        if crc32 != crc32_calc(section) {
            error!("[decrypt {}] PMT checksum mismatch", self.name);
            return;
        }
        if self.pmt.crc32 != 0 {
            warn!("[decrypt {}] PMT changed. Reload stream info", self.name);
            self.stream_reload();
            return;
        }
        self.pmt.crc32 = crc32;

        let pmt = match parse_pmt(section) {
            Ok(pmt) => pmt,
            Err(e) => {
                error!("[decrypt {}] bad PMT: {}", self.name, e);
                return;
            }
        };

        self.ecm_pid_fails = 0;
        let mut is_ecm_selected = false;
        let mut accepted: Vec<u16> = Vec::new();

        if self.forced_ecm_pid != 0 {
            self.stream[self.forced_ecm_pid as usize] = PidKind::Ecm;
            info!("[decrypt {}] Select ECM pid:{}", self.name, self.forced_ecm_pid);
            is_ecm_selected = true;
        }

        for ca in pmt.descriptors.iter().filter_map(|d| d.as_ca()) {
            self.consider_ca_pid(&ca, &mut is_ecm_selected, &mut accepted);
        }
        for stream in &pmt.streams {
            for ca in stream.descriptors.iter().filter_map(|d| d.as_ca()) {
                self.consider_ca_pid(&ca, &mut is_ecm_selected, &mut accepted);
            }
        }
        self.ecm_candidates = accepted.clone();

        if self.cas.is_none() || is_ecm_selected {
            let caid = self.caid;
            match rewrite_pmt(section, &mut |ca| ca.caid == caid && accepted.contains(&ca.pid)) {
                Ok(rewritten) => self.custom_pmt = rewritten,
                Err(e) => {
                    error!("[decrypt {}] PMT rewrite failed: {}", self.name, e);
                    self.custom_pmt = section.to_vec();
                }
            }
        } else {
            error!("[decrypt {}] ECM is not found", self.name);
            self.custom_pmt = section.to_vec();
        }
        self.send_custom_pmt(sink);
    }

    fn consider_ca_pid(
        &mut self,
        ca: &CaDescriptor,
        is_ecm_selected: &mut bool,
        accepted: &mut Vec<u16>,
    ) {
        let pid = ca.pid as usize;
        if self.stream[pid] == PidKind::Ca {
            self.stream[pid] = PidKind::Unknown;
        }
        if ca.pid == NULL_TS_PID || self.stream[pid] != PidKind::Unknown {
            return;
        }

        let ours = self.caid != 0
            && ca.caid == self.caid
            && match self.cas.as_mut() {
                Some(cas) => cas.check_descriptor(ca),
                None => false,
            };
        if ours {
            accepted.push(ca.pid);
            if !*is_ecm_selected {
                self.stream[pid] = PidKind::Ecm;
                info!("[decrypt {}] Select ECM pid:{}", self.name, ca.pid);
                *is_ecm_selected = true;
            } else {
                info!("[decrypt {}] Backup ECM pid:{}", self.name, ca.pid);
                self.stream[pid] = PidKind::Ca;
            }
        } else {
            self.stream[pid] = PidKind::Ca;
        }
    }

    fn send_custom_pmt(&mut self, sink: &mut dyn PacketSink) {
        if self.custom_pmt.is_empty() {
            return;
        }
        let section = std::mem::take(&mut self.custom_pmt);
        send_section(self.pmt_pid, &section, &mut self.pmt_cc, sink);
        self.custom_pmt = section;
    }

    /*
     * EM
     */

    fn on_em(&mut self, section: &[u8]) {
        let Some(cam) = self.cam.clone() else {
            return;
        };
        if !cam.is_ready() {
            return;
        }
        if section.len() > EM_MAX_SIZE {
            error!(
                "[decrypt {}] Entitlement message size is greater than {}",
                self.name, EM_MAX_SIZE
            );
            return;
        }

        let em_type = section[0];
        if (em_type & 0xF0) != 0x80 {
            if (em_type & 0xF0) != 0x90 {
                error!("[decrypt {}] wrong packet type 0x{:02X}", self.name, em_type);
            }
            return;
        } else if em_type >= 0x82 {
            /* EMM */
            if cam.disable_emm() {
                return;
            }
        } else {
            /* ECM */
            if let Some(until) = self.ecm_pid_delay {
                if Instant::now() >= until {
                    self.ecm_pid_delay = None;
                    self.ecm_pid_fails = 0;
                } else {
                    return;
                }
            }
        }

        let force = self.force;
        let Some(cas) = self.cas.as_mut() else {
            return;
        };
        if !cas.check_em(section, force) {
            return;
        }
        self.force = false;

        self.counters.em_sent += 1;
        cam.send_em(section);
    }

    /*
     * CAM
     */

    pub fn on_cam_event(&mut self, event: CamEvent) {
        match event {
            CamEvent::Ready => self.on_cam_ready(),
            CamEvent::Error => self.on_cam_error(),
            CamEvent::Response { data, errmsg } => self.on_response(&data, errmsg.as_deref()),
        }
    }

    fn on_cam_ready(&mut self) {
        if let Some(caid) = self.cam.as_ref().map(|c| c.caid()) {
            self.caid = caid;
        }
        self.stream_reload();
    }

    fn on_cam_error(&mut self) {
        self.caid = 0x0000;
        self.is_keys = false;
    }

    pub fn on_response(&mut self, data: &[u8], errmsg: Option<&str>) {
        if data.len() < 3 || (data[0] & 0xFE) != 0x80 {
            return; /* Skip EMM */
        }

        match self.validate_response(data, errmsg) {
            Ok(()) => self.install_keys(data),
            Err(msg) => self.on_key_failure(data, msg),
        }
    }

    fn validate_response(&mut self, data: &[u8], errmsg: Option<&str>) -> Result<(), String> {
        if let Some(msg) = errmsg {
            return Err(msg.to_string());
        }
        let Some(cas) = self.cas.as_mut() else {
            return Err("CAS not initialized".to_string());
        };
        if !cas.check_keys(data) {
            return Err("Wrong ECM id".to_string());
        }
        if data[2] != 16 || data.len() < CAM_RESPONSE_SIZE {
            return Err(if data[2] == 0 {
                String::new()
            } else {
                "Wrong ECM length".to_string()
            });
        }

        let ck1 = data[3].wrapping_add(data[4]).wrapping_add(data[5]);
        let ck2 = data[7].wrapping_add(data[8]).wrapping_add(data[9]);
        if ck1 != data[6] || ck2 != data[10] {
            return Err("Wrong ECM checksum".to_string());
        }
        Ok(())
    }

    fn install_keys(&mut self, data: &[u8]) {
        if self.new_key[3] == data[6] && self.new_key[7] == data[10] {
            // even half unchanged: swap in the odd word at the next cluster
            self.pending = PendingKey::Odd;
            self.new_key[8..].copy_from_slice(&data[11..19]);
        } else if self.new_key[11] == data[14] && self.new_key[15] == data[18] {
            self.pending = PendingKey::Even;
            self.new_key[..8].copy_from_slice(&data[3..11]);
        } else {
            self.pending = PendingKey::None;
            let mut even = [0u8; 8];
            let mut odd = [0u8; 8];
            even.copy_from_slice(&data[3..11]);
            odd.copy_from_slice(&data[11..19]);
            self.cipher.set_control_word(Parity::Even, &even);
            self.cipher.set_control_word(Parity::Odd, &odd);
            self.new_key.copy_from_slice(&data[3..19]);
            if self.is_keys {
                warn!("[decrypt {}] Both keys changed", self.name);
            }
        }
        self.is_keys = true;

        self.ecm_pid_fails = 0;
        self.ecm_pid_delay = None;
    }

    fn on_key_failure(&mut self, data: &[u8], msg: String) {
        self.counters.key_errors += 1;

        if self.ecm_swap_time > 0 {
            self.ecm_pid_fails += 1;

            let candidates = &self.ecm_candidates;
            if let Some(cur) = candidates
                .iter()
                .position(|&p| self.stream[p as usize] == PidKind::Ecm)
            {
                let old = candidates[cur];
                let next = candidates[(cur + 1) % candidates.len()];
                if next != old {
                    self.stream[old as usize] = PidKind::Ca;
                    info!("[decrypt {}] Deselect ECM pid:{}", self.name, old);
                    self.stream[next as usize] = PidKind::Ecm;
                    info!("[decrypt {}] Select ECM pid:{}", self.name, next);
                }
            } else if let Some(&first) = candidates.first() {
                self.stream[first as usize] = PidKind::Ecm;
                info!("[decrypt {}] Select ECM pid:{}", self.name, first);
            }
            self.force = true;

            if self.ecm_pid_fails as usize >= self.ecm_candidates.len() {
                self.ecm_pid_delay =
                    Some(Instant::now() + Duration::from_secs(self.ecm_swap_time));
            } else {
                return; // keep trying the next candidate quietly
            }
        }

        let msg = if msg.is_empty() { "Unknown".to_string() } else { msg };
        error!(
            "[decrypt {}] ECM:0x{:02X} size:{} Not Found. {}",
            self.name, data[0], data[2], msg
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use crate::cam::CamProvider;
    use crate::csa::XorCipher;
    use crate::psi::cat::build_cat;
    use crate::psi::pat::build_pat;
    use crate::psi::pmt::build_pmt;
    use crate::types::OutputOptions;

    fn options(name: &str) -> Options {
        Options {
            name: name.into(),
            input: SocketAddr::from(([127, 0, 0, 1], 0)),
            refresh_secs: 2,
            biss: None,
            cam: None,
            cas_data: None,
            ecm_pid: 0,
            ecm_swap_time: 0,
            reload_delay: 0,
            algo: 1,
            output: OutputOptions::default(),
        }
    }

    fn feed_section(dec: &mut Decryptor, pid: u16, section: &[u8], sink: &mut Vec<Vec<u8>>) {
        let mut pkts: Vec<Vec<u8>> = Vec::new();
        let mut cc = 0u8;
        send_section(pid, section, &mut cc, &mut pkts);
        for p in &pkts {
            dec.on_ts(p, sink).unwrap();
        }
    }

    fn video_packet(pid: u16, sc_bits: u8, tag: u8) -> Vec<u8> {
        let mut ts = vec![0u8; TS_PACKET_SIZE];
        ts[0] = 0x47;
        ts[1] = ((pid >> 8) & 0x1F) as u8;
        ts[2] = (pid & 0xFF) as u8;
        ts[3] = sc_bits | 0x10;
        for (i, b) in ts[4..].iter_mut().enumerate() {
            *b = tag.wrapping_add(i as u8);
        }
        ts
    }

    fn cw(b0: u8, b1: u8, b2: u8, b4: u8, b5: u8, b6: u8) -> [u8; 8] {
        [
            b0,
            b1,
            b2,
            b0.wrapping_add(b1).wrapping_add(b2),
            b4,
            b5,
            b6,
            b4.wrapping_add(b5).wrapping_add(b6),
        ]
    }

    fn key_response(even: &[u8; 8], odd: &[u8; 8]) -> Vec<u8> {
        let mut d = vec![0x80, 0x00, 0x10];
        d.extend_from_slice(even);
        d.extend_from_slice(odd);
        d
    }

    fn build_ecm(parity: u8, chid: u16) -> Vec<u8> {
        let mut s = vec![parity, 0x70, 0x00, 0x00, 0x00, 0x00];
        s.extend_from_slice(&chid.to_be_bytes());
        s.extend_from_slice(&[0u8; 8]);
        let len = s.len() - 3;
        s[2] = len as u8;
        s
    }

    struct FakeCam {
        caid: u16,
        disable_emm: bool,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Default for FakeCam {
        fn default() -> Self {
            Self {
                caid: 0x0624,
                disable_emm: false,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl CamClient for FakeCam {
        fn is_ready(&self) -> bool {
            true
        }
        fn caid(&self) -> u16 {
            self.caid
        }
        fn ua(&self) -> [u8; 8] {
            [0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44]
        }
        fn providers(&self) -> Vec<CamProvider> {
            vec![CamProvider {
                id: [0; 4],
                sa: [0, 0, 0, 0, 0x03, 0xAA, 0xBB, 0xCC],
            }]
        }
        fn disable_emm(&self) -> bool {
            self.disable_emm
        }
        fn send_em(&self, section: &[u8]) {
            self.sent.lock().unwrap().push(section.to_vec());
        }
    }

    const CA_512: &[u8] = &[0x09, 0x04, 0x06, 0x24, 0xE2, 0x00];
    const CA_513: &[u8] = &[0x09, 0x04, 0x06, 0x24, 0xE2, 0x01];

    #[test]
    fn clear_passthrough_rewrites_pmt_and_forwards_video() {
        let opts = options("clear");
        let mut dec = Decryptor::new(&opts, None).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();

        let pat = build_pat(&[(1, 256)]);
        feed_section(&mut dec, 0, &pat, &mut out);
        assert!(out.is_empty()); // tables are consumed, not forwarded
        assert_eq!(dec.pnr(), 1);
        assert_eq!(dec.pmt_pid(), 256);

        let pmt = build_pmt(1, 512, &[], &[(0x1B, 512, &[])]);
        feed_section(&mut dec, 256, &pmt, &mut out);
        assert!(!out.is_empty());

        // the emitted PMT reassembles to the input section
        let mut reasm = PsiBuffer::new();
        let mut done = false;
        for p in &out {
            if reasm.ingest(p) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(reasm.section(), &pmt[..]);

        let pmt_packets = out.len();
        for i in 0..5u8 {
            let v = video_packet(512, 0x00, i);
            dec.on_ts(&v, &mut out).unwrap();
            assert_eq!(out.last().unwrap(), &v); // clear payload is byte-identical
        }
        assert_eq!(out.len(), pmt_packets + 5);
    }

    #[test]
    fn biss_decrypts_even_packets() {
        let mut opts = options("biss");
        opts.biss = Some("1122330044556600".into());
        let mut dec = Decryptor::new(&opts, None).unwrap();
        assert_eq!(dec.caid(), 0x2600);
        assert!(dec.keys_set());

        let mut out: Vec<Vec<u8>> = Vec::new();
        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);
        feed_section(
            &mut dec,
            256,
            &build_pmt(1, 512, &[], &[(0x1B, 512, &[])]),
            &mut out,
        );
        out.clear();

        let v = video_packet(512, 0x80, 7); // even-scrambled
        dec.on_ts(&v, &mut out).unwrap();
        assert!(out.is_empty()); // held until the cluster drains
        dec.flush(&mut out);
        assert_eq!(out.len(), 1);

        let got = &out[0];
        assert_eq!(packet::scrambling_control(got), Scrambling::Clear);
        assert_eq!(&got[..3], &v[..3]);
        // derived BISS key: checksums folded into bytes 3 and 7
        let key = [0x11, 0x22, 0x33, 0x66, 0x44, 0x55, 0x66, 0xFF];
        for (i, b) in got[4..].iter().enumerate() {
            assert_eq!(*b, v[4 + i] ^ key[i % 8]);
        }
    }

    #[test]
    fn bad_biss_is_fatal() {
        let mut opts = options("biss");
        opts.biss = Some("112233".into());
        assert!(Decryptor::new(&opts, None).is_err());
        opts.biss = Some("11223300445566zz".into());
        assert!(Decryptor::new(&opts, None).is_err());
    }

    #[test]
    fn unsupported_caid_is_fatal_when_cam_ready() {
        let cam = Arc::new(FakeCam {
            caid: 0x0500,
            ..Default::default()
        });
        let opts = options("viaccess");
        let mut dec = Decryptor::new(&opts, Some(cam)).unwrap();

        let mut pkts: Vec<Vec<u8>> = Vec::new();
        let mut cc = 0u8;
        send_section(0, &build_pat(&[(1, 256)]), &mut cc, &mut pkts);
        let mut out: Vec<Vec<u8>> = Vec::new();
        assert!(dec.on_ts(&pkts[0], &mut out).is_err());
    }

    #[test]
    fn key_install_and_odd_rollover() {
        let cam = Arc::new(FakeCam::default());
        let opts = options("keys");
        let mut dec =
            Decryptor::with_cipher(&opts, Some(cam), Box::new(XorCipher::new(2))).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);

        let k_even = cw(1, 2, 3, 4, 5, 6);
        let k_odd = cw(9, 8, 7, 6, 5, 4);
        dec.on_response(&key_response(&k_even, &k_odd), None);
        assert!(dec.keys_set());

        // only the odd half changes: install waits for the cluster boundary
        let k_odd2 = cw(0x20, 0x21, 0x22, 0x23, 0x24, 0x25);
        dec.on_response(&key_response(&k_even, &k_odd2), None);

        out.clear();
        let v = video_packet(512, 0xC0, 3); // odd-scrambled
        dec.on_ts(&v, &mut out).unwrap();
        dec.flush(&mut out);
        assert_eq!(out.len(), 1);
        for (i, b) in out[0][4..].iter().enumerate() {
            assert_eq!(*b, v[4 + i] ^ k_odd[i % 8]); // old key for this cluster
        }

        out.clear();
        let v2 = video_packet(512, 0xC0, 4);
        dec.on_ts(&v2, &mut out).unwrap();
        dec.flush(&mut out);
        for (i, b) in out[0][4..].iter().enumerate() {
            assert_eq!(*b, v2[4 + i] ^ k_odd2[i % 8]); // new key from the boundary on
        }
    }

    #[test]
    fn bad_checksum_response_rejected() {
        let cam = Arc::new(FakeCam::default());
        let opts = options("checksum");
        let mut dec = Decryptor::new(&opts, Some(cam)).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);

        let mut bad = key_response(&cw(1, 2, 3, 4, 5, 6), &cw(9, 8, 7, 6, 5, 4));
        bad[6] ^= 0xFF;
        dec.on_response(&bad, None);
        assert!(!dec.keys_set());
        assert_eq!(dec.counters.key_errors, 1);
    }

    #[test]
    fn ecm_failover_rotates_then_cools_down() {
        let cam = Arc::new(FakeCam::default());
        let mut opts = options("failover");
        opts.ecm_swap_time = 5;
        opts.cas_data = Some("0bb8".into()); // preselect chid 0x0BB8
        let mut dec = Decryptor::new(&opts, Some(cam.clone())).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();

        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);
        let pmt = build_pmt(1, 650, &[CA_512, CA_513], &[(0x1B, 650, &[])]);
        feed_section(&mut dec, 256, &pmt, &mut out);
        assert_eq!(dec.ecm_pid(), Some(512));
        assert_eq!(dec.ecm_candidates, vec![512, 513]);

        feed_section(&mut dec, 512, &build_ecm(0x80, 0x0BB8), &mut out);
        assert_eq!(cam.sent.lock().unwrap().len(), 1);

        // rejection rotates to the backup and forces the next ECM through
        dec.on_response(&[0x80, 0x00, 0x10], Some("Error"));
        assert_eq!(dec.ecm_pid(), Some(513));
        assert_eq!(dec.ecm_pid_fails(), 1);
        assert!(dec.force);

        // same parity, but force overrides the de-duplication
        feed_section(&mut dec, 513, &build_ecm(0x80, 0x0BB8), &mut out);
        assert_eq!(cam.sent.lock().unwrap().len(), 2);

        // cycle complete: cooldown engages
        dec.on_response(&[0x80, 0x00, 0x10], Some("Error"));
        assert_eq!(dec.ecm_pid(), Some(512));
        assert!(dec.ecm_pid_delay.is_some());

        // ECMs are dropped until the cooldown expires
        feed_section(&mut dec, 512, &build_ecm(0x81, 0x0BB8), &mut out);
        assert_eq!(cam.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn cat_reload_debounce() {
        let cam = Arc::new(FakeCam::default());
        let mut opts = options("cat");
        opts.reload_delay = 2;
        let mut dec = Decryptor::new(&opts, Some(cam)).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);

        let cat_a = build_cat(&[&[0x09, 0x04, 0x06, 0x24, 0xE3, 0x00]]);
        let cat_b = build_cat(&[&[0x09, 0x04, 0x06, 0x24, 0xE3, 0x01]]);

        feed_section(&mut dec, 1, &cat_a, &mut out);
        assert_eq!(dec.stream[0x300], PidKind::Emm);

        feed_section(&mut dec, 1, &cat_a, &mut out); // plain repeat
        assert_eq!(dec.cat.reload_counter, 0);

        feed_section(&mut dec, 1, &cat_b, &mut out); // first changed repeat
        assert_eq!(dec.cat.reload_counter, 1);
        assert_eq!(dec.stream[0x300], PidKind::Emm); // no reload yet

        feed_section(&mut dec, 1, &cat_b, &mut out); // second one reloads
        assert_eq!(dec.stream[0x300], PidKind::Unknown);
        assert_eq!(dec.stream[256], PidKind::Unknown);
    }

    #[test]
    fn em_type_filter() {
        let cam = Arc::new(FakeCam::default());
        let mut opts = options("emtype");
        opts.cas_data = Some("0bb8".into());
        let mut dec = Decryptor::new(&opts, Some(cam.clone())).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);
        let pmt = build_pmt(1, 650, &[CA_512], &[(0x1B, 650, &[])]);
        feed_section(&mut dec, 256, &pmt, &mut out);

        // 0x9x sections are ignored without complaint
        feed_section(&mut dec, 512, &build_ecm(0x90, 0x0BB8), &mut out);
        assert!(cam.sent.lock().unwrap().is_empty());

        // EMM addressed to our card goes through
        let mut emm = vec![0x82, 0x70, 0x00, (0x11 << 3) | 0x02, 0x22, 0x33];
        let len = emm.len() - 3;
        emm[2] = len as u8;
        dec.stream[0x290] = PidKind::Emm;
        feed_section(&mut dec, 0x290, &emm, &mut out);
        assert_eq!(cam.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn forced_ecm_pid_skips_selection() {
        let cam = Arc::new(FakeCam::default());
        let mut opts = options("forced");
        opts.ecm_pid = 777;
        let mut dec = Decryptor::new(&opts, Some(cam)).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        feed_section(&mut dec, 0, &build_pat(&[(1, 256)]), &mut out);
        let pmt = build_pmt(1, 650, &[CA_512], &[(0x1B, 650, &[])]);
        feed_section(&mut dec, 256, &pmt, &mut out);

        assert_eq!(dec.ecm_pid(), Some(777));
        // the descriptor-selected PID becomes a backup
        assert_eq!(dec.stream[512], PidKind::Ca);
    }
}
