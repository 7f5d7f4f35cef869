// psi/section.rs
//! Generic PSI / SI section reader with CRC-32 (MPEG-2) helpers.

use crc::{Crc, CRC_32_MPEG_2};

use crate::constants::CRC32_SIZE;

pub const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Header fields of an assembled section. `body` covers the bytes between
/// the fixed header and the CRC for long-form (syntax=1) sections, or
/// everything after the 3-byte header for short-form ones.
pub struct SectionReader<'a> {
    pub table_id: u8,
    pub syntax: bool,
    pub version: u8,
    pub current_next: bool,
    pub section_number: u8,
    pub last_section: u8,
    pub table_id_ext: u16, // program_number for PAT/PMT
    pub body: &'a [u8],
}

impl<'a> SectionReader<'a> {
    /// Validates lengths only; CRC checking is the caller's policy
    /// ([`crc32_stored`] / [`crc32_calc`]).
    pub fn new(section: &'a [u8]) -> anyhow::Result<Self> {
        if section.len() < 3 {
            anyhow::bail!("short section");
        }
        let table_id = section[0];
        let syntax = section[1] & 0x80 != 0;
        let sec_len = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        if section.len() != 3 + sec_len {
            anyhow::bail!("truncated section");
        }

        if !syntax {
            return Ok(Self {
                table_id,
                syntax,
                version: 0,
                current_next: true,
                section_number: 0,
                last_section: 0,
                table_id_ext: 0,
                body: &section[3..],
            });
        }

        if sec_len < 5 + CRC32_SIZE {
            anyhow::bail!("invalid section_length");
        }
        Ok(Self {
            table_id,
            syntax,
            version: (section[5] & 0x3E) >> 1,
            current_next: section[5] & 0x01 != 0,
            section_number: section[6],
            last_section: section[7],
            table_id_ext: u16::from_be_bytes(section[3..5].try_into()?),
            body: &section[8..section.len() - CRC32_SIZE],
        })
    }
}

/// CRC-32 carried in the trailing four bytes of a long-form section.
pub fn crc32_stored(section: &[u8]) -> u32 {
    let n = section.len();
    u32::from_be_bytes([section[n - 4], section[n - 3], section[n - 2], section[n - 1]])
}

/// CRC-32 (MPEG-2 polynomial) computed over the section minus its trailer.
pub fn crc32_calc(section: &[u8]) -> u32 {
    CRC_MPEG.checksum(&section[..section.len() - CRC32_SIZE])
}
