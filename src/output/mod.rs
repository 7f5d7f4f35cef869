//! UDP output stage: packetisation, optional RTP framing, and the
//! PCR-paced sender thread.
//!
//! Unpaced, packets are batched into 1316-byte datagrams and sent from the
//! ingest task. With `sync > 0` they go through an SPSC ring instead; a
//! dedicated thread re-derives the original timing from inter-PCR
//! intervals and spaces the sends accordingly.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use log::{error, info, warn};

use crate::constants::{
    PCR_CLOCK_HZ, RTP_HEADER_SIZE, RTP_PT_MP2T, TS_PACKET_SIZE, UDP_BUFFER_CAPACITY,
};
use crate::network::create_output_socket;
use crate::packet;
use crate::ring::{ring, RingConsumer, RingProducer};
use crate::types::{OutputOptions, PacketSink};

/// Accumulates packets into UDP datagrams on a connected non-blocking
/// socket. A failed or would-block send drops the datagram with a warning.
pub struct Packetizer {
    sock: UdpSocket,
    label: String,
    rtp: bool,
    rtpseq: u16,
    ssrc: u32,
    buffer: BytesMut,
}

impl Packetizer {
    pub(crate) fn new(sock: UdpSocket, label: String, rtp: bool) -> Self {
        Self {
            sock,
            label,
            rtp,
            rtpseq: 0,
            ssrc: rand::random(),
            buffer: BytesMut::with_capacity(RTP_HEADER_SIZE + UDP_BUFFER_CAPACITY),
        }
    }

    pub fn push(&mut self, ts: &[u8]) {
        if self.rtp && self.buffer.is_empty() {
            let msec = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u32;
            let mut hdr = [0u8; RTP_HEADER_SIZE];
            fill_rtp_header(&mut hdr, self.rtpseq, msec, self.ssrc);
            self.rtpseq = self.rtpseq.wrapping_add(1);
            self.buffer.extend_from_slice(&hdr);
        }

        self.buffer.extend_from_slice(ts);

        let header = if self.rtp { RTP_HEADER_SIZE } else { 0 };
        if self.buffer.len() - header >= UDP_BUFFER_CAPACITY {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.sock.send(&self.buffer) {
            warn!("[udp_output {}] error on send [{}]", self.label, e);
        }
        self.buffer.clear();
    }
}

/// RTP fixed header: V=2, PT=33 (MP2T), no padding/extension/CSRC.
fn fill_rtp_header(hdr: &mut [u8; RTP_HEADER_SIZE], seq: u16, msec: u32, ssrc: u32) {
    hdr[0] = 0x80;
    hdr[1] = RTP_PT_MP2T;
    hdr[2..4].copy_from_slice(&seq.to_be_bytes());
    hdr[4..8].copy_from_slice(&msec.to_be_bytes());
    hdr[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

enum Mode {
    Direct(Packetizer),
    Paced {
        tx: RingProducer,
        shutdown: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
        overflow_logged: u64,
    },
}

/// The decryptor-facing output: owns either the packetiser directly or the
/// producer half of the pacing ring.
pub struct Output {
    mode: Mode,
}

impl Output {
    pub fn open(name: &str, opts: &OutputOptions) -> anyhow::Result<Self> {
        let sock = create_output_socket(opts)?;
        let label = format!("{}:{}", opts.addr, opts.port);
        let packetizer = Packetizer::new(sock, label, opts.rtp);

        if opts.sync == 0 {
            return Ok(Self {
                mode: Mode::Direct(packetizer),
            });
        }

        // one fifth of a second of stream at the declared bitrate
        let capacity = opts.sync as usize * 200_000 / 8;
        let (tx, rx) = ring(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let instance = name.to_string();
        let handle = std::thread::Builder::new()
            .name("udp-pacer".into())
            .spawn(move || pacer_loop(rx, packetizer, flag, instance))?;

        Ok(Self {
            mode: Mode::Paced {
                tx,
                shutdown,
                handle: Some(handle),
                overflow_logged: 0,
            },
        })
    }

    /// Packets dropped on the paced ring so far.
    pub fn overflow(&self) -> u64 {
        match &self.mode {
            Mode::Direct(_) => 0,
            Mode::Paced { tx, .. } => tx.overflow(),
        }
    }

    pub fn shutdown(&mut self) {
        match &mut self.mode {
            Mode::Direct(p) => p.flush(),
            Mode::Paced {
                shutdown, handle, ..
            } => {
                shutdown.store(true, Ordering::Relaxed);
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl PacketSink for Output {
    fn send(&mut self, ts: &[u8]) {
        match &mut self.mode {
            Mode::Direct(p) => p.push(ts),
            Mode::Paced {
                tx, overflow_logged, ..
            } => {
                if tx.push(ts) {
                    let dropped = tx.overflow();
                    if dropped > *overflow_logged {
                        error!(
                            "[udp_output] sync buffer overflow. dropped {} packets",
                            dropped - *overflow_logged
                        );
                        *overflow_logged = dropped;
                    }
                }
            }
        }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacerState {
    Buffering,
    FirstPcr,
    Pacing,
    ResetOnError,
    Stopped,
}

/// Scans for the next packet carrying a PCR, starting `from` bytes past
/// the read cursor. Returns its byte offset.
fn seek_pcr(rx: &RingConsumer, from: usize) -> Option<usize> {
    let mut ts = [0u8; TS_PACKET_SIZE];
    let len = rx.len();
    let mut off = from;
    while off + TS_PACKET_SIZE <= len {
        if rx.read_at(off, &mut ts) && packet::has_pcr(&ts) {
            return Some(off);
        }
        off += TS_PACKET_SIZE;
    }
    None
}

/// Inter-PCR interval in milliseconds of the 27 MHz clock.
fn block_time_ms(pcr_delta: u64) -> f64 {
    pcr_delta as f64 * 1000.0 / PCR_CLOCK_HZ
}

fn pacer_loop(mut rx: RingConsumer, mut out: Packetizer, shutdown: Arc<AtomicBool>, name: String) {
    let mut state = PacerState::Buffering;
    let mut ts = [0u8; TS_PACKET_SIZE];

    let mut pcr_prev: u64 = 0;
    let mut sync_anchor = Instant::now();
    let mut block_time_total = 0.0f64; // scheduled ms since the anchor
    let mut drift = 0.0f64; // scheduled - real, ms

    info!("[udp_output {}] buffering...", name);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            state = PacerState::Stopped;
        }

        match state {
            PacerState::Stopped => {
                out.flush();
                return;
            }

            PacerState::Buffering => {
                if rx.len() < rx.capacity() / 2 {
                    std::thread::sleep(Duration::from_micros(100));
                } else {
                    state = PacerState::FirstPcr;
                }
            }

            PacerState::FirstPcr => match seek_pcr(&rx, 0) {
                None => {
                    error!("[udp_output {}] first PCR is not found", name);
                    let len = rx.len();
                    rx.advance(len);
                    info!("[udp_output {}] buffering...", name);
                    state = PacerState::Buffering;
                }
                Some(offset) => {
                    rx.advance(offset);
                    rx.read_at(0, &mut ts);
                    pcr_prev = packet::pcr_27mhz(&ts);
                    sync_anchor = Instant::now();
                    block_time_total = 0.0;
                    drift = 0.0;
                    state = PacerState::Pacing;
                }
            },

            PacerState::ResetOnError => {
                sync_anchor = Instant::now();
                block_time_total = 0.0;
                drift = 0.0;
                state = PacerState::Pacing;
            }

            PacerState::Pacing => {
                let Some(block_size) = seek_pcr(&rx, TS_PACKET_SIZE) else {
                    error!(
                        "[udp_output {}] sync failed. Next PCR is not found. reload buffer",
                        name
                    );
                    let len = rx.len();
                    rx.advance(len);
                    info!("[udp_output {}] buffering...", name);
                    state = PacerState::Buffering;
                    continue;
                };

                rx.read_at(block_size, &mut ts);
                let pcr = packet::pcr_27mhz(&ts);
                let block_time = block_time_ms(pcr.wrapping_sub(pcr_prev));
                pcr_prev = pcr;

                if block_time <= 0.0 || block_time > 200.0 {
                    error!(
                        "[udp_output {}] block time out of range: {:.2}",
                        name, block_time
                    );
                    rx.advance(block_size);
                    state = PacerState::ResetOnError;
                    continue;
                }
                block_time_total += block_time;

                let packets = (block_size / TS_PACKET_SIZE) as u64;
                let sleep_ns = if block_time + drift > 0.0 {
                    ((block_time + drift) * 1_000_000.0) as u64 / packets
                } else {
                    0
                };

                // emit the block, collapsing the sleep when running late
                let block_start = Instant::now();
                let mut scheduled_ns: u64 = 0;
                let mut sleep = sleep_ns;
                for _ in 0..packets {
                    if shutdown.load(Ordering::Relaxed) {
                        state = PacerState::Stopped;
                        break;
                    }
                    if rx.pop(&mut ts) {
                        out.push(&ts);
                    }
                    if sleep > 0 {
                        std::thread::sleep(Duration::from_nanos(sleep));
                    }
                    scheduled_ns += sleep_ns;
                    let real_ns = block_start.elapsed().as_nanos() as u64;
                    sleep = if real_ns > scheduled_ns { 0 } else { sleep_ns };
                }
                if state == PacerState::Stopped {
                    continue;
                }

                // reset the anchor on a system clock step
                drift = block_time_total - sync_anchor.elapsed().as_secs_f64() * 1e3;
                if !(-100.0..=100.0).contains(&drift) {
                    warn!(
                        "[udp_output {}] wrong syncing time: {:.2}ms. reset time values",
                        name, drift
                    );
                    state = PacerState::ResetOnError;
                }
            }
        }
    }
}
