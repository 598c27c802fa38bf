//! # fieldlink-session
//!
//! Reliable logical connection between a controller and a remote station
//! over an unreliable datagram transport: peer discovery and handshake,
//! liveness tracking, a fixed-cadence retransmission loop for outgoing
//! commands with at-least-once delivery, and an ordered, short-circuiting
//! callback chain demultiplexing inbound packets to subscribers.
//!
//! Wire format, socket construction, and discovery payload semantics stay
//! outside this crate, behind the [`transport`], [`udp::WireCodec`], and
//! [`discovery`] seams.
//!
//! ## Crate structure
//!
//! - [`error`] — protocol / transport error taxonomy
//! - [`datagram`] — in-memory datagram model
//! - [`command`] — commands and the pending-acknowledgment set
//! - [`callback`] — tri-state dispatch results and the callback chain
//! - [`transport`] — socket boundary traits
//! - [`udp`] — UDP transport behind a wire-codec seam
//! - [`discovery`] — peer announcement parsing and periodic announcer
//! - [`liveness`] — last-inbound-datagram timestamp
//! - [`cycle`] — 40 ms send cycle (retransmit + heartbeat)
//! - [`setup`] — one-shot setup task, receive pump, command processor
//! - [`config`] — session configuration (TOML-deserializable)
//! - [`session`] — the connection session orchestrator

pub mod callback;
pub mod command;
pub mod config;
pub mod cycle;
pub mod datagram;
pub mod discovery;
pub mod error;
pub mod liveness;
pub mod session;
pub mod setup;
pub mod transport;
pub mod udp;
