//! # Xylo - Client-Side XMPP Session Engine
//!
//! Session lifecycle, stream feature negotiation and reliable transports
//! for XMPP clients, with synchronous request/response correlation on top
//! of an asynchronous stanza stream.
//!
//! ## Features
//!
//! - **Sequential feature negotiation**: STARTTLS, SASL, stream
//!   compression and resource binding driven by a pluggable per-feature
//!   state machine
//! - **Request/response correlation**: `query()` matches responses to
//!   requests by stanza id, with per-call timeouts
//! - **Pluggable transports**: persistent TCP (with TLS upgrade and zlib
//!   compression) and BOSH long polling over HTTP
//! - **Automatic reconnection**: truncated binary exponential backoff,
//!   suppressed when the session was deliberately replaced
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │  connect() / login() / query() / send()
//!     ▼
//! ┌───────────────────────────────────────────┐
//! │                 Session                   │
//! │  lifecycle · correlation · dispatch loop  │
//! └──────┬──────────────────────────┬─────────┘
//!        │ NegotiationEngine        │ Transport
//!        ▼                          ▼
//! ┌──────────────┐        ┌──────────────────┐
//! │ StartTLS     │        │ TcpTransport     │
//! │ SASL (PLAIN) │        │ BoshTransport    │
//! │ Compression  │        └──────────────────┘
//! └──────────────┘
//! ```
//!
//! ### Lifecycle
//!
//! ```text
//!                  connect()
//!   [Initial] ──────────────────> [Connecting] ──> [Connected]
//!                                                       │ login()
//!                                                       v
//!                        [Authenticated] <── [Authenticating]
//!                                │ failure
//!                                v
//!                         [Disconnected] ──close()──> [Closing] ──> [Closed]
//! ```
//!
//! `connect()` resolves once negotiation pauses just before
//! authentication; `login()` authenticates with SASL PLAIN, restarts the
//! stream and binds a resource.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use xylo::{Session, SessionConfig};
//!
//! let config = SessionConfig::for_domain("example.org");
//! let session = Session::new(config);
//!
//! session.connect().await?;
//! let jid = session.login("alice", "secret").await?;
//! println!("bound as {jid}");
//!
//! // Synchronous request/response.
//! use xylo::stanza::Iq;
//! use xylo::xml::Element;
//! let ping = Iq::get(Element::new("ping").attr("xmlns", "urn:xmpp:ping"));
//! let response = session.query(ping).await?;
//!
//! // Asynchronous inbound traffic.
//! let mut stanzas = session.stanzas();
//! while let Ok(stanza) = stanzas.recv().await {
//!     println!("got {stanza:?}");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: lifecycle, correlation and reconnection
//! - [`negotiation`]: stream feature negotiation engine
//! - [`transport`]: TCP and BOSH transports
//! - [`stanza`]: minimal typed stanza model
//! - [`xml`]: element tree and incremental stream decoder
//! - [`config`]: configuration management
//! - [`error`]: error types and result alias

pub mod config;
pub mod error;
pub mod negotiation;
pub mod session;
pub mod stanza;
pub mod transport;
pub mod xml;

// Re-exports for convenience
pub use config::{BoshConfig, ReconnectConfig, SessionConfig, TransportCandidate};
pub use error::{Error, Result};
pub use negotiation::{NegotiationEngine, Negotiator};
pub use session::{Session, SessionStatus, StatusChange};
pub use stanza::{Iq, IqKind, Jid, Stanza, StanzaError};
pub use transport::{BoshTransport, TcpTransport, Transport};
pub use xml::Element;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
