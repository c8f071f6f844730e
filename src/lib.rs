//! Network core for a small educational overlay routing system: a
//! Go-Back-N reliable byte transport and a distance-vector routing engine,
//! wired together by a composite node.
//!
//! See `error` for the crate-wide error type, `wire` for the JSON-over-UDP
//! envelope, `gbn` for the sliding-window transport, `routing` for the
//! distance-vector engine, `transport` for the UDP socket wrapper, `signal`
//! for Ctrl-C/SIGTERM handling, and `node` for the piece that ties them all
//! together.

pub mod error;
pub mod gbn;
pub mod node;
pub mod routing;
pub mod signal;
pub mod transport;
pub mod wire;

pub use error::{NetCoreError, Result};
