//! Transport layer abstraction.
//!
//! Provides pluggable transport backends:
//! - **TCP**: persistent byte stream with optional TLS upgrade and
//!   negotiated zlib compression
//! - **BOSH**: reliable long-polling HTTP binding that emulates a duplex
//!   stream with numbered, acknowledged requests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Session                   │
//! │          (Transport-Agnostic)           │
//! └──────────────────┬──────────────────────┘
//!                    │
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  TcpTransport   │ │  BoshTransport  │
//! │ (byte stream)   │ │ (long polling)  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! Inbound traffic is pushed through an event channel handed to
//! [`Transport::open`]; outbound elements go through [`Transport::send`],
//! which the session calls from a single serialized writer task.

mod bosh;
mod tcp;

pub use bosh::{
    BoshAction, BoshEngine, BoshRequest, BoshTransport, FlushOutcome, KeySequence, RequestKind,
    NS_HTTPBIND,
};
pub use tcp::{AsyncStream, TcpTransport, TlsUpgrader};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::xml::Element;

/// Inbound traffic and lifecycle signals delivered by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream header (or its BOSH equivalent) arrived.
    Header(Element),
    /// A complete top-level element arrived.
    Element {
        /// Raw text as received (empty for transports that re-frame).
        raw: String,
        /// Decoded element.
        element: Element,
    },
    /// The remote closed the stream in an orderly way.
    StreamClosed,
    /// Unrecoverable transport failure.
    Failed(Error),
}

/// Sender half of the transport event channel.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiver half of the transport event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Negotiable stream compression methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// zlib (RFC 1950) full-stream compression.
    Zlib,
}

impl CompressionMethod {
    /// Wire name of the method.
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Zlib => "zlib",
        }
    }

    /// Look up a method by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "zlib" => Some(CompressionMethod::Zlib),
            _ => None,
        }
    }
}

/// A byte-oriented or HTTP-oriented channel to the server.
///
/// Implementations deliver inbound traffic through the event channel
/// passed to [`open`](Transport::open) and must preserve the submission
/// order of [`send`](Transport::send) calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel and begin delivering events.
    async fn open(&self, events: EventSender) -> Result<()>;

    /// Write one element. Completion means the element was handed to the
    /// underlying channel, not that the peer received it.
    async fn send(&self, element: Element) -> Result<()>;

    /// Upgrade the channel to TLS.
    async fn secure(&self) -> Result<()>;

    /// Enable stream compression with a negotiated method.
    async fn compress(&self, method: CompressionMethod) -> Result<()>;

    /// Begin a fresh stream on the existing channel, forgetting decoder
    /// state. Used after TLS, SASL and compression negotiation.
    async fn restart_stream(&self) -> Result<()>;

    /// Close the channel in an orderly way.
    async fn close(&self) -> Result<()>;

    /// Wait until the channel is fully closed.
    async fn wait_closed(&self);

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}

/// Convenience constructor for the "no active transport" error.
pub(crate) fn not_open() -> Error {
    Error::IllegalState("transport is not open".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_method_names() {
        assert_eq!(CompressionMethod::Zlib.name(), "zlib");
        assert_eq!(
            CompressionMethod::from_name("zlib"),
            Some(CompressionMethod::Zlib)
        );
        assert_eq!(CompressionMethod::from_name("lzw"), None);
    }
}
