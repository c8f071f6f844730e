//! Distance-vector-only binary: runs the routing engine over a real UDP
//! endpoint with no GBN probing.
//!
//! ```text
//! dvnode <local-port> [<port> <loss>]* [last]
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use netcore::node::EndpointSink;
use netcore::routing::DvEngine;
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

struct DvHandler {
    dv: Arc<DvEngine<EndpointSink>>,
}

impl MessageHandler for DvHandler {
    fn on_message(&self, _from: IpAddr, message: Message) {
        match message {
            Message::Dv { port, vector } => self.dv.handle_incoming(port, vector),
            other => tracing::warn!(kind = ?other, "dvnode ignoring non-dv message"),
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (local_port, neighbors, initiator) = parse_dv_args(&args)?;

    let endpoint = Arc::new(Endpoint::bind(local_port)?);
    let sink = EndpointSink(Arc::clone(&endpoint));
    let dv = Arc::new(DvEngine::new(local_port, &neighbors, sink));

    if initiator {
        dv.dispatch();
    }

    netcore::signal::spawn_wait(endpoint.stop_flag());
    let handler = DvHandler { dv };

    tracing::info!(port = local_port, initiator, "dvnode starting");
    endpoint.listen(&handler)
}

fn valid_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|&p| p >= 1024)
}

/// Parses `<local-port> [<port> <loss>]* [last]`.
fn parse_dv_args(args: &[String]) -> Result<(u16, Vec<(u16, f64)>, bool)> {
    if args.is_empty() {
        return Err(NetCoreError::InvalidArgument(usage()));
    }

    let local_port = valid_port(&args[0])
        .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid <local-port>: {}", args[0])))?;

    let initiator = args.last().map(String::as_str) == Some("last");
    let rest = if initiator { &args[1..args.len() - 1] } else { &args[1..] };

    if rest.len() % 2 != 0 {
        return Err(NetCoreError::InvalidArgument(
            "neighbor options must be in pairs of (port, loss)".into(),
        ));
    }

    let mut neighbors = Vec::new();
    let mut iter = rest.iter();
    while let (Some(port_arg), Some(loss_arg)) = (iter.next(), iter.next()) {
        let port = valid_port(port_arg)
            .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid neighbor port: {port_arg}")))?;
        let loss: f64 = loss_arg
            .parse()
            .map_err(|_| NetCoreError::InvalidArgument(format!("invalid loss rate: {loss_arg}")))?;
        neighbors.push((port, loss));
    }

    Ok((local_port, neighbors, initiator))
}

fn usage() -> String {
    "usage: dvnode <local-port> [<port> <loss>]* [last]".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_neighbors_and_last() {
        let args: Vec<String> = ["1024", "1025", "0.01", "1026", "0.05", "last"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (port, neighbors, initiator) = parse_dv_args(&args).unwrap();
        assert_eq!(port, 1024);
        assert_eq!(neighbors, vec![(1025, 0.01), (1026, 0.05)]);
        assert!(initiator);
    }

    #[test]
    fn parses_no_neighbors() {
        let args: Vec<String> = ["1024".to_string()];
        let (port, neighbors, initiator) = parse_dv_args(&args).unwrap();
        assert_eq!(port, 1024);
        assert!(neighbors.is_empty());
        assert!(!initiator);
    }

    #[test]
    fn rejects_odd_pair_count() {
        let args: Vec<String> = ["1024", "1025"].iter().map(|s| s.to_string()).collect();
        assert!(parse_dv_args(&args).is_err());
    }
}
