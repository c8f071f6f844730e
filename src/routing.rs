//! Distance-vector (Bellman-Ford-style) routing table.
//!
//! Maintains `{destination -> (cost, hops)}` for this node, relaxes incoming
//! neighbor vectors against it, and re-broadcasts the table to every known
//! neighbor whenever relaxation changes it. The engine never talks to a
//! socket directly: it is parameterized by a `Broadcaster` capability
//! supplied by the composite node (see `node.rs`), so there is no back
//! pointer from the routing layer into the transport layer.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One entry of a routing table: the best known cost to a destination and
/// the path of intermediate hops to reach it (empty for direct neighbors
/// and self).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub cost: f64,
    pub hops: Vec<u16>,
}

impl RouteEntry {
    fn direct(cost: f64) -> Self {
        Self { cost, hops: Vec::new() }
    }
}

pub type Vector = BTreeMap<u16, RouteEntry>;

/// Rounds a cost to two decimal places, matching the original's
/// `round(x, 2)` contract for floating-point stability.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Formats a loss/cost value the way Python's `str(float)` does: whole
/// values keep a trailing `.0` (`0.0`, `1.0`) rather than Rust's default
/// `{}` Display, which drops the decimal point entirely for integral
/// `f64`s. Non-whole values are unaffected.
pub fn format_loss(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Relax `existing` against a neighbor vector received from `incoming_port`.
///
/// Returns `true` if `existing` changed. Entries naming `self_port` are
/// ignored; entries for previously-unknown destinations are admitted.
pub fn relax(self_port: u16, incoming_port: u16, incoming: &Vector, existing: &mut Vector) -> bool {
    let Some(link_cost) = existing.get(&incoming_port).map(|e| e.cost) else {
        // We have no known cost to the peer that sent this vector; nothing
        // to relax against.
        return false;
    };

    let mut changed = false;
    for (&dest, entry) in incoming.iter() {
        if dest == self_port {
            continue;
        }

        let candidate_cost = round2(link_cost + entry.cost);
        match existing.get(&dest) {
            None => {
                existing.insert(
                    dest,
                    RouteEntry { cost: candidate_cost, hops: vec![incoming_port] },
                );
                changed = true;
            }
            Some(current) if candidate_cost < current.cost => {
                existing.insert(
                    dest,
                    RouteEntry { cost: candidate_cost, hops: vec![incoming_port] },
                );
                changed = true;
            }
            Some(_) => {}
        }
    }
    changed
}

/// Capability the engine uses to reach the network; implemented by the
/// composite node, which owns the actual socket.
pub trait Broadcaster: Send + Sync {
    fn send_dv(&self, to_port: u16, vector: &Vector);
}

/// The routing table plus the machinery to relax and disseminate it.
pub struct DvEngine<B: Broadcaster> {
    self_port: u16,
    table: Mutex<Vector>,
    broadcaster: B,
    received_first_dv: Mutex<bool>,
}

impl<B: Broadcaster> DvEngine<B> {
    /// Build the initial table: `{neighbor: (loss, [])}` for each configured
    /// neighbor plus `{self: (0, [])}`.
    pub fn new(self_port: u16, neighbors: &[(u16, f64)], broadcaster: B) -> Self {
        let mut table = Vector::new();
        table.insert(self_port, RouteEntry::direct(0.0));
        for &(port, loss) in neighbors {
            table.insert(port, RouteEntry::direct(round2(loss)));
        }
        print_table(self_port, &table);
        Self {
            self_port,
            table: Mutex::new(table),
            broadcaster,
            received_first_dv: Mutex::new(false),
        }
    }

    /// A point-in-time copy of the table.
    pub fn snapshot(&self) -> Vector {
        self.table.lock().clone()
    }

    /// Broadcast the current table to every destination except self.
    pub fn dispatch(&self) {
        let snapshot = self.table.lock().clone();
        self.dispatch_vector(&snapshot);
    }

    fn dispatch_vector(&self, vector: &Vector) {
        for &dest in vector.keys() {
            if dest == self.self_port {
                continue;
            }
            tracing::info!("Message sent from Node {} to Node {}", self.self_port, dest);
            self.broadcaster.send_dv(dest, vector);
        }
    }

    /// Handle an incoming `dv` message: relax, print, and (if changed)
    /// re-broadcast.
    ///
    /// A node's very first received `dv`, regardless of whether relaxing
    /// against it changes the table, also triggers a re-broadcast. Without
    /// this, a chain topology never converges past one hop: the first vector
    /// any node ever sends, by construction, contains only destinations its
    /// recipient already knows at an equal or better cost, so strict
    /// change-gating would leave every node but the dispatcher's immediate
    /// neighbor in the dark forever.
    pub fn handle_incoming(&self, incoming_port: u16, incoming_vector: Vector) {
        tracing::info!(
            "Message received at Node {} from Node {}",
            self.self_port,
            incoming_port
        );

        let mut table = self.table.lock();
        let changed = relax(self.self_port, incoming_port, &incoming_vector, &mut table);
        print_table(self.self_port, &table);

        let first_receipt = {
            let mut seen = self.received_first_dv.lock();
            let was_first = !*seen;
            *seen = true;
            was_first
        };

        if changed || first_receipt {
            let snapshot = table.clone();
            drop(table);
            self.dispatch_vector(&snapshot);
        }
    }

    /// Overwrite the direct cost to `neighbor` (used when a GBN probe round
    /// produces a fresh measured loss rate) and re-broadcast if it changed
    /// the table.
    pub fn set_link_cost(&self, neighbor: u16, cost: f64) {
        let cost = round2(cost);
        let mut table = self.table.lock();
        let should_dispatch = match table.get_mut(&neighbor) {
            Some(entry) if entry.cost != cost => {
                entry.cost = cost;
                entry.hops.clear();
                true
            }
            Some(_) => false,
            None => {
                table.insert(neighbor, RouteEntry::direct(cost));
                true
            }
        };
        print_table(self.self_port, &table);
        if should_dispatch {
            let snapshot = table.clone();
            drop(table);
            self.dispatch_vector(&snapshot);
        }
    }
}

/// Print the routing table snapshot in the stable log format:
/// `[<timestamp>] Node <self> Routing Table` followed by one row per entry.
pub fn print_table(self_port: u16, table: &Vector) {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    tracing::info!("[{ts}] Node {self_port} Routing Table");
    for (dest, entry) in table {
        let cost = format_loss(entry.cost);
        if entry.hops.is_empty() {
            tracing::info!("- ({cost}) -> Node {dest}");
        } else {
            let hops: String = entry
                .hops
                .iter()
                .map(|h| format!("; Next hop -> {h}"))
                .collect();
            tracing::info!("- ({cost}) -> Node {dest}{hops}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cost: f64, hops: &[u16]) -> RouteEntry {
        RouteEntry { cost, hops: hops.to_vec() }
    }

    #[test]
    fn initializes_self_and_neighbors() {
        let neighbors = [(1025u16, 0.01), (1026u16, 0.05)];
        struct NullBroadcaster;
        impl Broadcaster for NullBroadcaster {
            fn send_dv(&self, _to_port: u16, _vector: &Vector) {}
        }
        let engine = DvEngine::new(1024, &neighbors, NullBroadcaster);
        let table = engine.snapshot();
        assert_eq!(table[&1024], entry(0.0, &[]));
        assert_eq!(table[&1025], entry(0.01, &[]));
        assert_eq!(table[&1026], entry(0.05, &[]));
    }

    #[test]
    fn relax_admits_new_destination() {
        let mut existing = Vector::new();
        existing.insert(1024, entry(0.0, &[]));
        existing.insert(1025, entry(0.01, &[]));

        let mut incoming = Vector::new();
        incoming.insert(1025, entry(0.0, &[]));
        incoming.insert(1027, entry(0.03, &[]));

        let changed = relax(1024, 1025, &incoming, &mut existing);
        assert!(changed);
        assert_eq!(existing[&1027], entry(0.04, &[1025]));
    }

    #[test]
    fn relax_ignores_self_entry() {
        let mut existing = Vector::new();
        existing.insert(1024, entry(0.0, &[]));
        existing.insert(1025, entry(0.01, &[]));

        let mut incoming = Vector::new();
        incoming.insert(1024, entry(0.0, &[]));

        let changed = relax(1024, 1025, &incoming, &mut existing);
        assert!(!changed);
        assert_eq!(existing[&1024], entry(0.0, &[]));
    }

    #[test]
    fn relax_keeps_incumbent_on_tie() {
        let mut existing = Vector::new();
        existing.insert(1024, entry(0.0, &[]));
        existing.insert(1025, entry(0.01, &[]));
        existing.insert(1027, entry(0.05, &[1026]));

        let mut incoming = Vector::new();
        incoming.insert(1027, entry(0.04, &[]));

        // link cost 0.01 + 0.04 == 0.05, a tie with the incumbent.
        let changed = relax(1024, 1025, &incoming, &mut existing);
        assert!(!changed);
        assert_eq!(existing[&1027], entry(0.05, &[1026]));
    }

    #[test]
    fn relax_prefers_strictly_cheaper_path() {
        let mut existing = Vector::new();
        existing.insert(1024, entry(0.0, &[]));
        existing.insert(1025, entry(0.01, &[]));
        existing.insert(1027, entry(0.10, &[1026]));

        let mut incoming = Vector::new();
        incoming.insert(1027, entry(0.03, &[]));

        let changed = relax(1024, 1025, &incoming, &mut existing);
        assert!(changed);
        assert_eq!(existing[&1027], entry(0.04, &[1025]));
    }

    #[test]
    fn triangle_shortcut_prefers_direct_link() {
        // A-B 1.0, B-C 1.0, A-C 1.5: A's route to C should stay direct.
        let mut existing = Vector::new();
        existing.insert(1, entry(0.0, &[])); // A = self
        existing.insert(2, entry(1.0, &[])); // B
        existing.insert(3, entry(1.5, &[])); // C direct

        let mut incoming = Vector::new();
        incoming.insert(3, entry(1.0, &[])); // B's cost to C

        let changed = relax(1, 2, &incoming, &mut existing);
        // candidate via B: 1.0 + 1.0 = 2.0, worse than the direct 1.5.
        assert!(!changed);
        assert_eq!(existing[&3], entry(1.5, &[]));
    }

    #[test]
    fn set_link_cost_updates_direct_entry() {
        struct NullBroadcaster;
        impl Broadcaster for NullBroadcaster {
            fn send_dv(&self, _to_port: u16, _vector: &Vector) {}
        }
        let engine = DvEngine::new(1024, &[(1025, 0.5)], NullBroadcaster);
        engine.set_link_cost(1025, 0.2);
        assert_eq!(engine.snapshot()[&1025], entry(0.2, &[]));
    }
}
