use crate::constants::CRC32_SIZE;
use crate::psi::desc::{ca_view, parse_descriptors, CaDescriptor, Descriptor};
use crate::psi::section::{SectionReader, CRC_MPEG};

/// ─────────── PMT ───────────
#[derive(Clone)]
pub struct PmtSection {
    pub version: u8,
    pub program_number: u16,
    pub pcr_pid: u16,
    pub descriptors: Vec<Descriptor>,
    pub streams: Vec<PmtStream>,
}
#[derive(Clone)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub descriptors: Vec<Descriptor>,
}

pub fn parse_pmt(section: &[u8]) -> anyhow::Result<PmtSection> {
    let sec = SectionReader::new(section)?;
    if sec.table_id != 0x02 {
        anyhow::bail!("not PMT");
    }
    let b = sec.body;
    if b.len() < 4 {
        anyhow::bail!("short PMT body");
    }

    let pcr_pid = (((b[0] & 0x1F) as u16) << 8) | (b[1] as u16);
    let prog_info_len = (((b[2] & 0x0F) as usize) << 8) | (b[3] as usize);
    let mut idx = 4 + prog_info_len;
    if idx > b.len() {
        anyhow::bail!("bad program_info_length");
    }
    let descriptors = parse_descriptors(&b[4..idx]);

    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stype = b[idx];
        let pid = (((b[idx + 1] & 0x1F) as u16) << 8) | (b[idx + 2] as u16);
        let eslen = (((b[idx + 3] & 0x0F) as usize) << 8) | (b[idx + 4] as usize);
        let es_end = (idx + 5 + eslen).min(b.len());
        streams.push(PmtStream {
            stream_type: stype,
            elementary_pid: pid,
            descriptors: parse_descriptors(&b[idx + 5..es_end]),
        });
        idx += 5 + eslen;
    }

    Ok(PmtSection {
        version: sec.version,
        program_number: sec.table_id_ext,
        pcr_pid,
        descriptors,
        streams,
    })
}

/// Builds the downstream PMT: drops CA descriptors for which `should_strip`
/// returns `true` (top-level and per-stream), keeps every other descriptor
/// byte-for-byte, and recomputes `program_info_length`, each
/// `ES_info_length`, `section_length` and the trailing CRC-32.
pub fn rewrite_pmt(
    section: &[u8],
    should_strip: &mut dyn FnMut(&CaDescriptor) -> bool,
) -> anyhow::Result<Vec<u8>> {
    let sec = SectionReader::new(section)?;
    if sec.table_id != 0x02 || !sec.syntax {
        anyhow::bail!("not PMT");
    }
    let body_end = section.len() - CRC32_SIZE;
    if body_end < 12 {
        anyhow::bail!("short PMT");
    }

    let mut keep = |raw: &[u8]| match ca_view(raw) {
        Some(ca) => !should_strip(&ca),
        None => true,
    };

    let mut out = Vec::with_capacity(section.len());
    out.extend_from_slice(&section[..12]); // fixed header through program_info_length

    let prog_info_len = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;
    let pi_end = (12 + prog_info_len).min(body_end);
    let mut idx = 12;
    while idx + 2 <= pi_end {
        let size = 2 + section[idx + 1] as usize;
        if idx + size > pi_end {
            break;
        }
        if keep(&section[idx..idx + size]) {
            out.extend_from_slice(&section[idx..idx + size]);
        }
        idx += size;
    }
    let new_pil = out.len() - 12;
    out[10] = (section[10] & 0xF0) | ((new_pil >> 8) as u8 & 0x0F);
    out[11] = new_pil as u8;

    idx = pi_end;
    while idx + 5 <= body_end {
        let es_len = (((section[idx + 3] & 0x0F) as usize) << 8) | section[idx + 4] as usize;
        let es_end = (idx + 5 + es_len).min(body_end);

        let hdr = out.len();
        out.extend_from_slice(&section[idx..idx + 5]);
        let mut d_idx = idx + 5;
        while d_idx + 2 <= es_end {
            let size = 2 + section[d_idx + 1] as usize;
            if d_idx + size > es_end {
                break;
            }
            if keep(&section[d_idx..d_idx + size]) {
                out.extend_from_slice(&section[d_idx..d_idx + size]);
            }
            d_idx += size;
        }
        let new_es = out.len() - hdr - 5;
        out[hdr + 3] = (section[idx + 3] & 0xF0) | ((new_es >> 8) as u8 & 0x0F);
        out[hdr + 4] = new_es as u8;

        idx += 5 + es_len;
    }

    let new_len = out.len() + CRC32_SIZE - 3;
    out[1] = (section[1] & 0xF0) | ((new_len >> 8) as u8 & 0x0F);
    out[2] = new_len as u8;
    let crc = CRC_MPEG.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Test helper: builds a CRC-correct single-section PMT from
/// (pnr, pcr_pid, program descriptors, streams).
#[cfg(test)]
pub(crate) fn build_pmt(
    pnr: u16,
    pcr_pid: u16,
    prog_descs: &[&[u8]],
    streams: &[(u8, u16, &[&[u8]])],
) -> Vec<u8> {
    let mut s = vec![0x02, 0xB0, 0x00];
    s.extend_from_slice(&pnr.to_be_bytes());
    s.push(0xC1); // version 0, current_next
    s.push(0x00);
    s.push(0x00);
    s.push(0xE0 | ((pcr_pid >> 8) & 0x1F) as u8);
    s.push((pcr_pid & 0xFF) as u8);
    let mut prog: Vec<u8> = Vec::new();
    for d in prog_descs {
        prog.extend_from_slice(d);
    }
    s.push(0xF0 | ((prog.len() >> 8) & 0x0F) as u8);
    s.push(prog.len() as u8);
    s.extend_from_slice(&prog);
    for &(stype, pid, descs) in streams {
        s.push(stype);
        s.push(0xE0 | ((pid >> 8) & 0x1F) as u8);
        s.push((pid & 0xFF) as u8);
        let mut es: Vec<u8> = Vec::new();
        for d in descs {
            es.extend_from_slice(d);
        }
        s.push(0xF0 | ((es.len() >> 8) & 0x0F) as u8);
        s.push(es.len() as u8);
        s.extend_from_slice(&es);
    }
    let len = s.len() - 3 + 4;
    s[1] = (s[1] & 0xF0) | ((len >> 8) as u8 & 0x0F);
    s[2] = len as u8;
    let crc = CRC_MPEG.checksum(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}
