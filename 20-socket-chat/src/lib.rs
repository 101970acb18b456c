//! Chat over three transports at once.
//!
//! Clients talk to the server over TCP, may opt into a UDP relay the server
//! runs on the same port, and share a multicast group with every other client
//! on the network. Each module owns one concern:
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`protocol`] holds the wire conventions: sentinels, notices, payloads,
//!   and the unframed read/write helpers.
//! - [`registry`] is the server's lock-protected record of TCP clients and
//!   UDP subscribers.
//! - [`server`] runs the accept/datagram loop, per-connection sessions, the
//!   UDP relay, and the shutdown procedure.
//! - [`multicast`] joins the multicast group with the platform-specific bind.
//! - [`client`] connects to the server and multiplexes the three receive
//!   loops with interactive input.
//!
//! Integration tests use this crate directly to exercise the server over real
//! sockets.

pub mod cli;
pub mod client;
pub mod multicast;
pub mod protocol;
pub mod registry;
pub mod server;
