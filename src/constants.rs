//! Constants for MPEG-TS processing and descrambling

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// 13-bit PID space
pub const MAX_PID: usize = 8192;
pub const NULL_TS_PID: u16 = 0x1FFF;

/// PSI section constants
pub const PSI_MAX_SIZE: usize = 4096;
pub const PSI_HEADER_SIZE: usize = 3;
pub const CRC32_SIZE: usize = 4;

/// Entitlement message (ECM/EMM) section size limit
pub const EM_MAX_SIZE: usize = 512;

/// CAM key response: status | id | len | even[8] | odd[8]
pub const CAM_RESPONSE_SIZE: usize = 19;

/// PCR constants
pub const PCR_CLOCK_HZ: f64 = 27_000_000.0; // 27 MHz

/// UDP payload sizing: whole TS packets per datagram
pub const UDP_BUFFER_SIZE: usize = 1460;
pub const UDP_BUFFER_CAPACITY: usize = (UDP_BUFFER_SIZE / TS_PACKET_SIZE) * TS_PACKET_SIZE;

/// RTP framing (RFC 2250)
pub const RTP_HEADER_SIZE: usize = 12;
pub const RTP_PT_MP2T: u8 = 33;
