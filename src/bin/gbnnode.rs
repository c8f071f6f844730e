//! GBN-only binary: a single sender/receiver engine bound to one peer, with
//! an interactive prompt for enqueueing transfers.
//!
//! ```text
//! gbnnode <self-port> <peer-port> <window-size> (-p <prob> | -d <k>)
//! ```
//!
//! At the prompt: `send <text>` enqueues `<text>` for transmission to the
//! peer.

use std::io::BufRead;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use netcore::gbn::{DropPolicy, GbnEngine, PacketSink};
use netcore::node::EndpointSink;
use netcore::transport::{Endpoint, MessageHandler};
use netcore::wire::Message;
use netcore::{NetCoreError, Result};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    netcore::signal::block_default_disposition();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

struct GbnHandler<S: PacketSink> {
    peer_port: u16,
    engine: Arc<GbnEngine<S>>,
}

impl<S: PacketSink + 'static> MessageHandler for GbnHandler<S> {
    fn on_message(&self, _from: IpAddr, message: Message) {
        if message.port() != self.peer_port {
            tracing::warn!(from = message.port(), expected = self.peer_port, "message from unexpected peer");
            return;
        }
        match message {
            Message::Data { packet_num, total_message, payload, .. } => {
                self.engine.handle_data(packet_num, payload, &total_message)
            }
            Message::Ack { packet_num, .. } => self.engine.handle_ack(packet_num),
            Message::Stats { dropped_packets, total_packets, .. } => {
                self.engine.handle_stats(dropped_packets, total_packets)
            }
            Message::Dv { .. } => tracing::warn!("gbnnode ignoring dv message"),
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_gbn_args(&args)?;

    let endpoint = Arc::new(Endpoint::bind(config.self_port)?);
    let sink = Arc::new(EndpointSink(Arc::clone(&endpoint)));
    let engine = GbnEngine::new(config.self_port, config.peer_port, config.window_size, config.drop_policy, sink, |dropped, total| {
        tracing::info!(dropped, total, "probe summary");
    });
    let mut handles = GbnEngine::spawn(&engine);

    netcore::signal::spawn_wait(endpoint.stop_flag());

    let listener_endpoint = Arc::clone(&endpoint);
    let handler = Arc::new(GbnHandler { peer_port: config.peer_port, engine: Arc::clone(&engine) });
    let listener = thread::Builder::new()
        .name("gbnnode-listen".into())
        .spawn(move || {
            let handler: &dyn MessageHandler = handler.as_ref();
            if let Err(err) = listener_endpoint.listen(handler) {
                tracing::error!(%err, "listener stopped with error");
            }
        })
        .expect("spawn listener thread");

    tracing::info!(self_port = config.self_port, peer_port = config.peer_port, "gbnnode ready, type `send <text>`");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ') {
            Some(("send", text)) if !text.is_empty() => engine.enqueue(text),
            _ => eprintln!("usage: send <text>"),
        }
        if endpoint.stop_flag().load(Ordering::SeqCst) {
            break;
        }
    }

    endpoint.request_stop();
    engine.shutdown();
    let _ = listener.join();
    for handle in handles.drain(..) {
        let _ = handle.join();
    }
    Ok(())
}

struct GbnConfig {
    self_port: u16,
    peer_port: u16,
    window_size: u32,
    drop_policy: DropPolicy,
}

fn valid_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|&p| p >= 1024)
}

/// Parses `<self-port> <peer-port> <window-size> (-p <prob> | -d <k>)`.
fn parse_gbn_args(args: &[String]) -> Result<GbnConfig> {
    if args.len() != 5 {
        return Err(NetCoreError::InvalidArgument(usage()));
    }

    let self_port = valid_port(&args[0])
        .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid <self-port>: {}", args[0])))?;
    let peer_port = valid_port(&args[1])
        .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid <peer-port>: {}", args[1])))?;
    let window_size: u32 = args[2]
        .parse()
        .map_err(|_| NetCoreError::InvalidArgument(format!("invalid <window-size>: {}", args[2])))?;

    let drop_policy = match args[3].as_str() {
        "-p" => {
            let p: f64 = args[4]
                .parse()
                .map_err(|_| NetCoreError::InvalidArgument(format!("invalid probability: {}", args[4])))?;
            if !(0.0..=1.0).contains(&p) {
                return Err(NetCoreError::InvalidArgument("-p probability must be within [0,1]".into()));
            }
            DropPolicy::Probabilistic(p)
        }
        "-d" => {
            let k: u32 = args[4]
                .parse()
                .map_err(|_| NetCoreError::InvalidArgument(format!("invalid divisor: {}", args[4])))?;
            DropPolicy::Deterministic(k)
        }
        other => return Err(NetCoreError::InvalidArgument(format!("unknown drop flag: {other}\n{}", usage()))),
    };

    Ok(GbnConfig { self_port, peer_port, window_size, drop_policy })
}

fn usage() -> String {
    "usage: gbnnode <self-port> <peer-port> <window-size> (-p <prob> | -d <k>)".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probabilistic_flag() {
        let args: Vec<String> = ["5000", "5001", "2", "-p", "0"].iter().map(|s| s.to_string()).collect();
        let config = parse_gbn_args(&args).unwrap();
        assert_eq!(config.self_port, 5000);
        assert_eq!(config.peer_port, 5001);
        assert_eq!(config.window_size, 2);
        assert!(matches!(config.drop_policy, DropPolicy::Probabilistic(p) if p == 0.0));
    }

    #[test]
    fn parses_deterministic_flag() {
        let args: Vec<String> = ["5000", "5001", "3", "-d", "3"].iter().map(|s| s.to_string()).collect();
        let config = parse_gbn_args(&args).unwrap();
        assert!(matches!(config.drop_policy, DropPolicy::Deterministic(3)));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let args: Vec<String> = ["5000", "5001", "2", "-p", "1.5"].iter().map(|s| s.to_string()).collect();
        assert!(parse_gbn_args(&args).is_err());
    }

    #[test]
    fn rejects_wrong_arg_count() {
        let args: Vec<String> = ["5000", "5001"].iter().map(|s| s.to_string()).collect();
        assert!(parse_gbn_args(&args).is_err());
    }
}
