//! Datagram endpoint: the UDP socket wrapper shared by every engine on a
//! node.
//!
//! Owns exactly one `UdpSocket` bound to the node's listening port and
//! exposes two operations: a thread-safe `send` and a blocking `listen` that
//! dispatches each decoded datagram to a registered handler. Reliability,
//! ordering, and retry are someone else's problem -- the GBN engine's -- by
//! design; this layer never retries and never reorders.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::wire::{self, Message, MAX_DATAGRAM_SIZE};

/// Receives every successfully decoded datagram. Implemented by the
/// composite node, which fans a message out to the right GBN engine or the
/// DV engine based on its `type` and sender port.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, from: IpAddr, message: Message);
}

/// A UDP socket bound to one node's listening port.
pub struct Endpoint {
    socket: UdpSocket,
    stop: Arc<AtomicBool>,
    local_port: u16,
}

impl Endpoint {
    /// Bind to `0.0.0.0:<listen_port>` and install the 1-second poll timeout
    /// that bounds `listen()`'s shutdown latency.
    pub fn bind(listen_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        Ok(Self {
            socket,
            stop: Arc::new(AtomicBool::new(false)),
            local_port: listen_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// A clone of the stop flag, for callers that want to trigger shutdown
    /// from elsewhere (e.g. a signal handler).
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Serialize and transmit `message` to `(ip, port)`. `send_to` on a UDP
    /// socket is atomic at the OS level, so no additional lock is taken here
    /// even though the socket is shared across every GBN engine's threads.
    pub fn send_to(&self, message: &Message, port: u16, ip: Ipv4Addr) -> Result<()> {
        let bytes = wire::encode(message)?;
        self.socket.send_to(&bytes, (ip, port))?;
        Ok(())
    }

    /// Convenience for this system's only real destination: localhost.
    pub fn send_local(&self, message: &Message, port: u16) -> Result<()> {
        self.send_to(message, port, Ipv4Addr::LOCALHOST)
    }

    /// Block, dispatching every decoded datagram to `handler`, until the
    /// stop flag is set. Malformed datagrams and unknown message types are
    /// logged and dropped rather than tearing down the loop.
    pub fn listen(&self, handler: &dyn MessageHandler) -> Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        while !self.stop.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => match wire::decode(&buf[..len]) {
                    Ok(message) => handler.on_message(src.ip(), message),
                    Err(err) => tracing::warn!(%src, %err, "dropping malformed datagram"),
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
