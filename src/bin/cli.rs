use clap::Parser;
use mpegts_descrambler::descrambler::{run, Options, OutputOptions};

#[derive(Parser)]
struct Opt {
    /// Instance name used in logs and reports
    #[clap(long)]
    name: String,

    /// UDP socket to bind + listen (IPv4)
    #[clap(long, default_value = "239.1.1.1:1234")]
    input: String,

    /// BISS key, 16 hex chars (runs without a CAM)
    #[clap(long)]
    biss: Option<String>,

    /// Additional CAS parameters, hex string up to 32 bytes
    #[clap(long)]
    cas_data: Option<String>,

    /// Force a single ECM PID, bypassing PMT-driven selection
    #[clap(long, default_value_t = 0)]
    ecm_pid: u16,

    /// ECM failover cooldown in seconds (0 disables failover)
    #[clap(long, default_value_t = 0)]
    ecm_swap_time: u64,

    /// CAT repetitions to tolerate before reloading on CAT changes
    #[clap(long, default_value_t = 0)]
    reload_delay: u32,

    /// Batch primitive: 0 = FFdecsa-style, 1 = libdvbcsa-style
    #[clap(long, default_value_t = 0)]
    algo: u8,

    /// Output IPv4 address, multicast or unicast
    #[clap(long)]
    addr: String,

    /// Output UDP port
    #[clap(long, default_value_t = 1234)]
    port: u16,

    /// Multicast time to live
    #[clap(long, default_value_t = 32)]
    ttl: u32,

    /// IP address of the local interface for multicast sends
    #[clap(long)]
    localaddr: Option<String>,

    /// Socket send-buffer size
    #[clap(long)]
    socket_size: Option<usize>,

    /// Use RTP framing instead of raw UDP
    #[clap(long, default_value_t = false)]
    rtp: bool,

    /// PCR-paced output at this average Mbit/s (0 disables pacing)
    #[clap(long, default_value_t = 0)]
    sync: u32,

    /// Refresh interval for the JSON status snapshot
    #[clap(long, default_value_t = 2)]
    refresh: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let opt = Opt::parse();

    run(Options {
        name: opt.name,
        input: opt.input.parse()?,
        refresh_secs: opt.refresh,
        biss: opt.biss,
        cam: None,
        cas_data: opt.cas_data,
        ecm_pid: opt.ecm_pid,
        ecm_swap_time: opt.ecm_swap_time,
        reload_delay: opt.reload_delay,
        algo: opt.algo,
        output: OutputOptions {
            addr: opt.addr.parse()?,
            port: opt.port,
            ttl: opt.ttl,
            localaddr: match opt.localaddr {
                Some(value) => Some(value.parse()?),
                None => None,
            },
            socket_size: opt.socket_size,
            rtp: opt.rtp,
            sync: opt.sync,
        },
    })
    .await
}
