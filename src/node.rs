//! The composite node: wires the datagram endpoint, the per-peer GBN
//! engines, and the distance-vector engine together.
//!
//! Responsibilities (see `SPEC_FULL.md` §4.4): instantiate a receiver-role
//! GBN engine eagerly for every `recv_neighbor`, lazily start a sender-role
//! GBN engine the first time a `send_neighbor` needs probing, feed measured
//! loss rates back into the DV table, and print both the DV table (via
//! `routing::print_table`) and a link-loss summary once a second.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::gbn::{DropPolicy, GbnEngine, PacketSink};
use crate::routing::{Broadcaster, DvEngine, Vector};
use crate::transport::{Endpoint, MessageHandler};
use crate::wire::Message;

const PROBE_PAYLOAD: &str = "probe";

/// Rounds to two decimal places, matching `routing`'s contract.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Thin adapter so both `GbnEngine` and `DvEngine` can reach the network
/// through the same `Endpoint` without either depending on the other's
/// capability trait.
pub struct EndpointSink(pub Arc<Endpoint>);

impl PacketSink for EndpointSink {
    fn send(&self, message: &Message, to_port: u16) {
        if let Err(err) = self.0.send_local(message, to_port) {
            tracing::error!(port = to_port, %err, "transport send failed");
        }
    }
}

impl Broadcaster for EndpointSink {
    fn send_dv(&self, to_port: u16, vector: &Vector) {
        let message = Message::Dv {
            port: self.0.local_port(),
            vector: vector.clone(),
        };
        if let Err(err) = self.0.send_local(&message, to_port) {
            tracing::error!(port = to_port, %err, "transport send failed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkStats {
    sent: u32,
    lost: u32,
    rate: f64,
}

/// Static configuration a node is started with (the CLI's positional
/// grammar, already parsed and validated).
pub struct NodeConfig {
    pub local_port: u16,
    pub recv_neighbors: Vec<(u16, f64)>,
    pub send_neighbors: Vec<u16>,
    pub initiator: bool,
    pub window_size: u32,
    pub drop_policy: DropPolicy,
}

pub struct CompositeNode {
    self_port: u16,
    endpoint: Arc<Endpoint>,
    dv: Arc<DvEngine<EndpointSink>>,
    window_size: u32,
    drop_policy: DropPolicy,
    send_neighbors: Vec<u16>,
    engines: Mutex<HashMap<u16, Arc<GbnEngine<EndpointSink>>>>,
    in_flight: Mutex<std::collections::HashSet<u16>>,
    loss_rates: Mutex<HashMap<u16, LinkStats>>,
    periodics_started: AtomicBool,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    self_weak: Mutex<Option<Weak<CompositeNode>>>,
}

impl CompositeNode {
    pub fn new(config: NodeConfig) -> crate::error::Result<Arc<Self>> {
        let endpoint = Arc::new(Endpoint::bind(config.local_port)?);
        let sink = Arc::new(EndpointSink(Arc::clone(&endpoint)));

        // DV table is seeded with the CLI-declared initial loss for every
        // recv_neighbor; probe measurements overwrite these costs once the
        // first round completes (see `update_loss`).
        let dv = DvEngine::new(config.local_port, &config.recv_neighbors, EndpointSink(Arc::clone(&endpoint)));
        let dv = Arc::new(dv);

        let node = Arc::new(Self {
            self_port: config.local_port,
            endpoint,
            dv,
            window_size: config.window_size,
            drop_policy: config.drop_policy,
            send_neighbors: config.send_neighbors,
            engines: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(std::collections::HashSet::new()),
            loss_rates: Mutex::new(HashMap::new()),
            periodics_started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            self_weak: Mutex::new(None),
        });
        *node.self_weak.lock() = Some(Arc::downgrade(&node));

        for &(peer_port, _initial_loss) in &config.recv_neighbors {
            node.spawn_engine(peer_port, sink.clone());
        }

        if config.initiator {
            node.dv.dispatch();
        }

        Ok(node)
    }

    pub fn self_port(&self) -> u16 {
        self.self_port
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    /// Snapshot of the current distance-vector routing table.
    pub fn routes(&self) -> Vector {
        self.dv.snapshot()
    }

    /// A clone of this node's own weak handle, for closures and spawned
    /// threads that must reach an `Arc<CompositeNode>` without this method
    /// itself needing a `self: Arc<Self>`/`&Arc<Self>` receiver (the latter
    /// isn't part of stable Rust's arbitrary-self-types whitelist).
    fn weak_self(&self) -> Weak<CompositeNode> {
        self.self_weak.lock().clone().unwrap_or_default()
    }

    /// Build (or fetch) the engine for `peer_port` and spawn its pump/timer
    /// threads. Used both eagerly at startup (recv_neighbors) and lazily the
    /// first time a send_neighbor is probed.
    fn spawn_engine(&self, peer_port: u16, sink: Arc<EndpointSink>) -> Arc<GbnEngine<EndpointSink>> {
        let weak = self.weak_self();
        let engine = GbnEngine::new(
            self.self_port,
            peer_port,
            self.window_size,
            self.drop_policy,
            sink,
            move |dropped, total| {
                if let Some(node) = weak.upgrade() {
                    node.on_link_stats(peer_port, dropped, total);
                }
            },
        );
        let mut handles = GbnEngine::spawn(&engine);
        self.threads.lock().append(&mut handles);
        self.engines.lock().insert(peer_port, engine.clone());
        engine
    }

    /// Called from a GBN engine's `on_stats` hook, regardless of whether
    /// this node played sender or receiver role in the completed transfer.
    fn on_link_stats(&self, peer_port: u16, dropped: u32, total: u32) {
        let rate = if total == 0 { 0.0 } else { round2(dropped as f64 / total as f64) };
        self.loss_rates.lock().insert(peer_port, LinkStats { sent: total, lost: dropped, rate });
        self.dv.set_link_cost(peer_port, rate);

        self.in_flight.lock().remove(&peer_port);
        if self.send_neighbors.contains(&peer_port) {
            self.start_probe(peer_port);
        }
    }

    /// Start (or continue) the probing loop toward `peer_port`, honoring
    /// the one-in-flight-per-peer rule.
    fn start_probe(&self, peer_port: u16) {
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains(&peer_port) {
                return;
            }
            in_flight.insert(peer_port);
        }

        let engine = {
            let engines = self.engines.lock();
            engines.get(&peer_port).cloned()
        };
        let engine = engine.unwrap_or_else(|| {
            let sink = Arc::new(EndpointSink(self.endpoint()));
            self.spawn_engine(peer_port, sink)
        });
        engine.enqueue(PROBE_PAYLOAD);
    }

    /// Triggered once, on receipt of the first DV message: starts probing
    /// every send_neighbor and the 1-second loss-rate printer.
    fn start_periodics(&self) {
        if self.periodics_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for &peer in &self.send_neighbors.clone() {
            self.start_probe(peer);
        }
        self.spawn_printer();
    }

    fn spawn_printer(&self) {
        let weak = self.weak_self();
        let handle = thread::Builder::new()
            .name(format!("loss-printer-{}", self.self_port))
            .spawn(move || loop {
                let Some(node) = weak.upgrade() else { break };
                if node.stop.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
                if node.stop.load(Ordering::SeqCst) {
                    break;
                }
                let snapshot: Vec<(u16, LinkStats)> =
                    node.loss_rates.lock().iter().map(|(&port, &stats)| (port, stats)).collect();
                for (port, stats) in snapshot {
                    tracing::info!(
                        "Link to {}: {} sent, {} lost, loss {}",
                        port,
                        stats.sent,
                        stats.lost,
                        crate::routing::format_loss(stats.rate)
                    );
                }
            })
            .expect("spawn loss printer thread");
        self.threads.lock().push(handle);
    }

    /// Block on the endpoint listener until the shared stop flag is set.
    /// Installs the SIGINT/SIGTERM handler first.
    pub fn run(&self) -> crate::error::Result<()> {
        crate::signal::spawn_wait(self.stop_flag());
        let endpoint = Arc::clone(&self.endpoint);
        let result = endpoint.listen(self);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        result
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.endpoint.request_stop();
        for engine in self.engines.lock().values() {
            engine.shutdown();
        }
    }
}

impl MessageHandler for CompositeNode {
    fn on_message(&self, _from: IpAddr, message: Message) {
        match message {
            Message::Dv { port, vector } => {
                self.dv.handle_incoming(port, vector);
                self.start_periodics();
            }
            Message::Data { port, packet_num, total_message, payload } => {
                match self.engines.lock().get(&port).cloned() {
                    Some(engine) => engine.handle_data(packet_num, payload, &total_message),
                    None => tracing::warn!(peer = port, "data packet from unknown peer"),
                }
            }
            Message::Ack { port, packet_num, .. } => {
                match self.engines.lock().get(&port).cloned() {
                    Some(engine) => engine.handle_ack(packet_num),
                    None => tracing::warn!(peer = port, "ack from unknown peer"),
                }
            }
            Message::Stats { port, dropped_packets, total_packets } => {
                match self.engines.lock().get(&port).cloned() {
                    Some(engine) => engine.handle_stats(dropped_packets, total_packets),
                    None => tracing::warn!(peer = port, "stats from unknown peer"),
                }
            }
        }
    }
}
