//! Core descrambling loop: UDP ingest, CAM event multiplexing, output.

use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::cam::CamEvent;
use crate::decrypt::Decryptor;
use crate::network::create_input_socket;
use crate::output::Output;
use crate::packet;
use crate::report::Reporter;
use crate::types::Options;

async fn next_cam_event(rx: &mut Option<mpsc::UnboundedReceiver<CamEvent>>) -> Option<CamEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Main entry point: binds the input socket, builds the decryptor and the
/// output stage, then pumps packets until the socket fails.
pub async fn run(mut opts: Options) -> anyhow::Result<()> {
    let socket = create_input_socket(&opts.input)?;
    let sock = UdpSocket::from_std(socket.into())?;

    let mut output = Output::open(&opts.name, &opts.output)?;

    let (cam_client, mut cam_events) = match opts.cam.take() {
        Some(handle) => (Some(handle.client), Some(handle.events)),
        None => (None, None),
    };
    let mut decryptor = Decryptor::new(&opts, cam_client)?;

    let mut buf = [0u8; 2048];
    let mut last_print = Instant::now();

    loop {
        tokio::select! {
            received = sock.recv(&mut buf) => {
                let n = received?;

                // Process TS packets (188 B aligned)
                for chunk in buf[..n].chunks_exact(188) {
                    if !packet::is_sync(chunk) {
                        continue; // bad sync
                    }
                    decryptor.on_ts(chunk, &mut output)?;
                }
            }

            event = next_cam_event(&mut cam_events) => {
                match event {
                    Some(event) => decryptor.on_cam_event(event),
                    None => {
                        // CAM channel closed: back to pass-through
                        decryptor.on_cam_event(CamEvent::Error);
                        cam_events = None;
                    }
                }
            }
        }

        // Periodic status snapshot
        if opts.refresh_secs > 0 && last_print.elapsed() >= Duration::from_secs(opts.refresh_secs) {
            let json = Reporter::generate_json_report(&decryptor, output.overflow());
            println!("{json}");
            last_print = Instant::now();
        }
    }
}
