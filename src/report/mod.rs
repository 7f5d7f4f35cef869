//! Status report generation for a descrambler instance

use serde::Serialize;

use crate::decrypt::Decryptor;

/// JSON snapshot of one instance (public API and CLI output)
#[derive(Debug, Clone, Serialize)]
pub struct DescramblerReport {
    pub ts_time: String,
    pub name: String,
    pub caid: String,
    pub pnr: u16,
    pub pmt_pid: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecm_pid: Option<u16>,
    pub keys_set: bool,
    pub ecm_pid_fails: u32,
    pub packets: u64,
    pub scrambled: u64,
    pub em_sent: u64,
    pub key_errors: u64,
    pub output_overflow: u64,
}

pub struct Reporter;

impl Reporter {
    /// Generate a structured report for API consumers
    pub fn create_report(dec: &Decryptor, output_overflow: u64) -> DescramblerReport {
        DescramblerReport {
            ts_time: chrono::Utc::now().to_rfc3339(),
            name: dec.name().to_string(),
            caid: format!("0x{:04X}", dec.caid()),
            pnr: dec.pnr(),
            pmt_pid: dec.pmt_pid(),
            ecm_pid: dec.ecm_pid(),
            keys_set: dec.keys_set(),
            ecm_pid_fails: dec.ecm_pid_fails(),
            packets: dec.counters.packets,
            scrambled: dec.counters.scrambled,
            em_sent: dec.counters.em_sent,
            key_errors: dec.counters.key_errors,
            output_overflow,
        }
    }

    /// Generate pretty-printed JSON string for CLI output
    pub fn generate_json_report(dec: &Decryptor, output_overflow: u64) -> String {
        serde_json::to_string_pretty(&Self::create_report(dec, output_overflow))
            .unwrap_or_else(|_| "{\"error\": \"JSON serialization failed\"}".to_string())
    }
}
