use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensor_pcap::{
    replay, replay_get_pcap_info, CancelToken, PlaybackConfig, PlaybackHandle, PortMap,
    RecordConfig, RecordHandle,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print packet statistics for a capture
    Info {
        input: PathBuf,

        /// Stop after this many frames
        #[arg(long)]
        max_packets: Option<u64>,
    },

    /// Replay a capture over UDP with its recorded timing
    Replay {
        input: PathBuf,

        /// Playback speed; 2.0 is twice real time
        #[arg(short, long, default_value_t = 1.0)]
        rate: f64,

        /// Local address to send from
        #[arg(long, default_value = "0.0.0.0")]
        src_ip: IpAddr,

        /// Target IP address
        #[arg(short, long, default_value = "127.0.0.1")]
        target_ip: IpAddr,

        /// Remap a recorded destination port, FROM:TO (repeatable)
        #[arg(long = "map", value_parser = parse_port_pair)]
        port_map: Vec<(u16, u16)>,
    },

    /// Record datagrams arriving on local UDP ports until Ctrl-C
    Record {
        output: PathBuf,

        /// UDP port to listen on (repeatable)
        #[arg(short, long = "port", required = true)]
        ports: Vec<u16>,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        listen_ip: IpAddr,

        /// Largest IP packet written before fragmenting
        #[arg(long, default_value_t = 1500)]
        frag_size: usize,

        /// Use Linux cooked capture framing
        #[arg(long)]
        sll: bool,
    },
}

fn parse_port_pair(s: &str) -> Result<(u16, u16), String> {
    let (from, to) = s
        .split_once(':')
        .ok_or_else(|| format!("expected FROM:TO, got {s:?}"))?;
    let from = from.parse().map_err(|e| format!("bad port {from:?}: {e}"))?;
    let to = to.parse().map_err(|e| format!("bad port {to:?}: {e}"))?;
    Ok((from, to))
}

/// Pause after the `failures`th receive error in a row: 10 ms doubling up to 1 s.
fn recv_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << exponent).min(Duration::from_secs(1))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    match args.command {
        Command::Info { input, max_packets } => {
            let stats = replay_get_pcap_info(&input, max_packets)
                .with_context(|| format!("reading {}", input.display()))?;
            println!("{stats:#?}");
        }
        Command::Replay {
            input,
            rate,
            src_ip,
            target_ip,
            port_map,
        } => {
            let config = PlaybackConfig {
                src_ip,
                dst_ip: target_ip,
                port_map: port_map.into_iter().collect::<PortMap>(),
                ..Default::default()
            };
            let handle = PlaybackHandle::open(&input, config)
                .with_context(|| format!("opening {}", input.display()))?;
            run_replay(handle, rate).await?;
        }
        Command::Record {
            output,
            ports,
            listen_ip,
            frag_size,
            sll,
        } => {
            let config = RecordConfig {
                frag_size,
                use_sll_encapsulation: sll,
                ..Default::default()
            };
            let handle = RecordHandle::create(&output, config)
                .with_context(|| format!("creating {}", output.display()))?;
            run_record(handle, listen_ip, &ports).await?;
        }
    }
    Ok(())
}

async fn run_replay(mut handle: PlaybackHandle, rate: f64) -> Result<()> {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || replay(&mut handle, rate, &token));

    let outcome = tokio::select! {
        res = &mut task => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping replay");
            cancel.cancel();
            task.await??
        }
    };
    println!("{outcome:?}");
    Ok(())
}

async fn run_record(mut handle: RecordHandle, listen_ip: IpAddr, ports: &[u16]) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<(u16, u16, Vec<u8>)>(1024);

    for &port in ports {
        let socket = UdpSocket::bind(SocketAddr::new(listen_ip, port))
            .await
            .with_context(|| format!("binding UDP port {port}"))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            let mut failures: u32 = 0;
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        failures = 0;
                        if tx.send((peer.port(), port, buf[..len].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = recv_backoff(failures);
                        warn!(port, failures, ?delay, "receive failed: {e}");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
    }
    drop(tx);
    info!(?ports, "recording, Ctrl-C to stop");

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some((src_port, dst_port, payload)) => {
                    handle.record_packet(src_port, dst_port, &payload)?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let packets = handle.packets();
    handle.finish().context("closing capture")?;
    println!("Total packets recorded: {packets}");
    Ok(())
}
