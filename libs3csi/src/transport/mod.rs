//! QUIC transport layer for CSI messages.
//!
//! [`CsiClient`] and [`CsiServer`] exchange JSON-encoded [`CsiMessage`]
//! values over QUIC bi-directional streams using `quinn`, one request and
//! one response per stream.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
