//! Composite node binary: wires a datagram endpoint, per-peer GBN probe
//! engines, and the distance-vector engine together, then runs until
//! interrupted.
//!
//! ```text
//! node <local-port> receive [<port> <loss>]* send [<port>]* [last]
//! ```

use netcore::gbn::DropPolicy;
use netcore::node::{CompositeNode, NodeConfig};
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

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_node_args(&args)?;
    let initiator = config.initiator;

    let node = CompositeNode::new(config)?;
    tracing::info!(port = node.self_port(), initiator, "node starting");
    node.run()
}

fn valid_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|&p| p >= 1024)
}

/// Parses `<local-port> receive [<port> <loss>]* send [<port>]* [last]`.
///
/// Hand-rolled over `std::env::args()`, in the same spirit as the original
/// `parse_args`/`parse_mode` functions: the grammar's repeating groups
/// bounded by literal keywords does not map onto a declarative flag parser.
fn parse_node_args(args: &[String]) -> Result<NodeConfig> {
    if args.is_empty() {
        return Err(NetCoreError::InvalidArgument(usage()));
    }

    let local_port = valid_port(&args[0])
        .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid <local-port>: {}", args[0])))?;

    let initiator = args.last().map(String::as_str) == Some("last");
    let rest = if initiator { &args[1..args.len() - 1] } else { &args[1..] };

    if rest.first().map(String::as_str) != Some("receive") {
        return Err(NetCoreError::InvalidArgument(format!(
            "expected `receive` after <local-port>\n{}",
            usage()
        )));
    }

    let send_idx = rest
        .iter()
        .position(|a| a == "send")
        .ok_or_else(|| NetCoreError::InvalidArgument(format!("expected `send` keyword\n{}", usage())))?;

    let receive_args = &rest[1..send_idx];
    let send_args = &rest[send_idx + 1..];

    if receive_args.len() % 2 != 0 {
        return Err(NetCoreError::InvalidArgument(
            "receive options must be in pairs of (port, loss)".into(),
        ));
    }

    let mut recv_neighbors = Vec::new();
    let mut iter = receive_args.iter();
    while let (Some(port_arg), Some(loss_arg)) = (iter.next(), iter.next()) {
        let port = valid_port(port_arg)
            .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid receive port: {port_arg}")))?;
        let loss: f64 = loss_arg
            .parse()
            .map_err(|_| NetCoreError::InvalidArgument(format!("invalid loss rate: {loss_arg}")))?;
        recv_neighbors.push((port, loss));
    }

    let mut send_neighbors = Vec::new();
    for port_arg in send_args {
        let port = valid_port(port_arg)
            .ok_or_else(|| NetCoreError::InvalidArgument(format!("invalid send port: {port_arg}")))?;
        send_neighbors.push(port);
    }

    Ok(NodeConfig {
        local_port,
        recv_neighbors,
        send_neighbors,
        initiator,
        // The node CLI's grammar has no drop-rate flag (unlike the
        // gbnnode-only binary); the composite node simply doesn't inject
        // loss of its own on top of whatever real link loss exists.
        window_size: 4,
        drop_policy: DropPolicy::Probabilistic(0.0),
    })
}

fn usage() -> String {
    "usage: node <local-port> receive [<port> <loss>]* send [<port>]* [last]".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_grammar_with_last() {
        let args: Vec<String> = ["4444", "receive", "2222", "0.8", "3333", "0.5", "send", "last"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = parse_node_args(&args).unwrap();
        assert_eq!(config.local_port, 4444);
        assert_eq!(config.recv_neighbors, vec![(2222, 0.8), (3333, 0.5)]);
        assert!(config.send_neighbors.is_empty());
        assert!(config.initiator);
    }

    #[test]
    fn parses_empty_receive_and_send_lists() {
        let args: Vec<String> = ["1111", "receive", "send", "2222", "3333"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = parse_node_args(&args).unwrap();
        assert_eq!(config.local_port, 1111);
        assert!(config.recv_neighbors.is_empty());
        assert_eq!(config.send_neighbors, vec![2222, 3333]);
        assert!(!config.initiator);
    }

    #[test]
    fn rejects_missing_receive_keyword() {
        let args: Vec<String> = ["1111", "send", "2222"].iter().map(|s| s.to_string()).collect();
        assert!(parse_node_args(&args).is_err());
    }

    #[test]
    fn rejects_invalid_local_port() {
        let args: Vec<String> = ["80", "receive", "send"].iter().map(|s| s.to_string()).collect();
        assert!(parse_node_args(&args).is_err());
    }

    #[test]
    fn rejects_odd_receive_pair_count() {
        let args: Vec<String> = ["1111", "receive", "2222", "send"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(parse_node_args(&args).is_err());
    }
}
