//! # SIP User Agent stack
//!
//! RFC 3261 signaling for the Quasar project: message parsing and
//! serialization, the four transaction state machines with their
//! retransmission timers, transport selection over UDP/TCP/TLS, dialog
//! bookkeeping, and the UAC/UAS cores driving request and response
//! workflows.
//!
//! ## Core components
//!
//! - **Message codec**: datagram and stream framing, the typed header
//!   catalog, URI handling
//! - **Transaction layer**: INVITE/non-INVITE client and server machines,
//!   timer-driven loss recovery, demultiplexing by branch
//! - **Transport layer**: per-destination selection and a connection cache
//!   for the stream transports
//! - **UA cores**: redirection, authentication retry, target-set failover
//!   and the server-side validation pipeline
//!
//! The entry point is [`ua::Ua`]: start one with a [`config::Config`] and
//! an application callback, then create and send requests through it.

pub mod abnf;
pub mod config;
pub mod dialog;
pub mod fsm;
pub mod headers;
pub mod ident;
pub mod message;
pub mod tcp;
pub mod tls;
pub mod transaction;
pub mod transport;
pub mod ua;
pub mod uac;
pub mod uas;
pub mod udp;
pub mod uri;
