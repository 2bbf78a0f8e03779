//! Peer-to-peer TCP tunnel.
//!
//! Run as `host` on machine A and `client` on machine B, and a TCP service on
//! A's loopback becomes reachable on B's loopback. A short-lived WebSocket
//! rendezvous ([`signaling`]) exchanges the session descriptor and
//! connectivity candidates, after which all traffic rides a single encrypted
//! QUIC connection ([`transport`]) carrying the multiplexed tunnel protocol
//! ([`protocol`], [`tunnel`]).

pub mod args;
pub mod endpoint;
pub mod protocol;
pub mod signaling;
pub mod stats;
pub mod transport;
pub mod tunnel;
