//! Session lifecycle and request/response correlation.
//!
//! A [`Session`] owns one transport at a time and drives it through the
//! lifecycle:
//!
//! ```text
//! Initial ──connect()──▶ Connecting ──▶ Connected
//!                                          │ login()
//!                                          ▼
//!                  Authenticating ──▶ Authenticated
//!                                          │ failure
//!            Disconnected ◀────────────────┘
//!                  │ close()
//!                  ▼
//!              Closing ──▶ Closed (terminal)
//! ```
//!
//! `connect()` resolves once feature negotiation stalls just before
//! authentication (or completes outright when the server requires none);
//! `login()` authenticates, restarts the stream and binds a resource.
//! Synchronous requests go through [`Session::query`], which correlates
//! the response by stanza id; everything else is fanned out to
//! subscribers of [`Session::stanzas`].
//!
//! Connection-level failures release the `connect()`/`login()` waiters
//! and, unless the failure was a `conflict` stream error, schedule
//! reconnection with backoff. In-flight queries are deliberately left to
//! their own timeouts.

mod reconnect;

pub use reconnect::{BinaryExponentialBackoff, ReconnectPolicy};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::{SessionConfig, TransportCandidate};
use crate::error::{Error, Result};
use crate::negotiation::{
    CompressionNegotiator, EngineStep, FeatureKind, NegotiationEngine, SaslNegotiator,
    StartTlsNegotiator, TransportDirective,
};
use crate::stanza::{bind_request, bound_jid, Iq, IqKind, Jid, Stanza, StanzaError};
use crate::transport::{
    BoshTransport, EventReceiver, TcpTransport, TlsUpgrader, Transport, TransportEvent,
};
use crate::xml::Element;

/// Namespace of defined stream error conditions.
const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
const XMPP_TCP_PORT: u16 = 5222;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, never connected.
    Initial,
    /// A transport candidate is being opened and negotiated.
    Connecting,
    /// Negotiated up to (but not including) authentication.
    Connected,
    /// Credentials are being exchanged.
    Authenticating,
    /// Authenticated and bound to a resource.
    Authenticated,
    /// Lost the connection; reconnection may be in progress.
    Disconnected,
    /// Orderly shutdown in progress.
    Closing,
    /// Shut down for good. Terminal.
    Closed,
}

impl SessionStatus {
    /// Whether a live transport is attached in this state.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionStatus::Connected | SessionStatus::Authenticating | SessionStatus::Authenticated
        )
    }
}

/// One lifecycle transition, broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// State before the transition.
    pub from: SessionStatus,
    /// State after the transition.
    pub to: SessionStatus,
    /// The failure that forced the transition, if any.
    pub cause: Option<String>,
}

struct Inner {
    config: SessionConfig,
    status: StdMutex<SessionStatus>,
    status_tx: broadcast::Sender<StatusChange>,
    stanza_tx: broadcast::Sender<Stanza>,
    engine: StdMutex<NegotiationEngine>,
    sasl: Arc<SaslNegotiator>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Iq>>>,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    writer: StdMutex<Option<mpsc::UnboundedSender<Element>>>,
    address: StdMutex<Option<Jid>>,
    credentials: StdMutex<Option<(String, String)>>,
    failure: StdMutex<Option<Error>>,
    tls: StdMutex<Option<Arc<dyn TlsUpgrader>>>,
    reconnect: StdMutex<Arc<dyn ReconnectPolicy>>,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    // Counts feature advertisements so waiters can tell a fresh stall
    // from leftover pre-restart state.
    features_epoch: AtomicU32,
    awaiting_restart: AtomicBool,
    progress: Notify,
}

/// Client session: lifecycle, negotiation and stanza exchange.
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session for the given configuration. No I/O happens
    /// until [`connect`](Session::connect).
    pub fn new(config: SessionConfig) -> Self {
        let sasl = Arc::new(SaslNegotiator::new());
        let mut engine = NegotiationEngine::new();
        engine.register(Arc::new(StartTlsNegotiator::new()));
        engine.register(sasl.clone());
        engine.register(Arc::new(CompressionNegotiator::new()));

        let (status_tx, _) = broadcast::channel(32);
        let (stanza_tx, _) = broadcast::channel(256);
        let reconnect: Arc<dyn ReconnectPolicy> =
            Arc::new(BinaryExponentialBackoff::new(config.reconnect.clone()));

        Session {
            inner: Arc::new(Inner {
                config,
                status: StdMutex::new(SessionStatus::Initial),
                status_tx,
                stanza_tx,
                engine: StdMutex::new(engine),
                sasl,
                pending: StdMutex::new(HashMap::new()),
                transport: StdMutex::new(None),
                writer: StdMutex::new(None),
                address: StdMutex::new(None),
                credentials: StdMutex::new(None),
                failure: StdMutex::new(None),
                tls: StdMutex::new(None),
                reconnect: StdMutex::new(reconnect),
                reconnecting: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                features_epoch: AtomicU32::new(0),
                awaiting_restart: AtomicBool::new(false),
                progress: Notify::new(),
            }),
        }
    }

    /// Install the TLS upgrader used when the server requires encryption
    /// on a TCP transport.
    pub fn with_tls_upgrader(self, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        *self.inner.tls.lock().expect("tls upgrader") = Some(upgrader);
        self
    }

    /// Replace the reconnection policy.
    pub fn with_reconnect_policy(self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        *self.inner.reconnect.lock().expect("reconnect policy") = policy;
        self
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock().expect("session status")
    }

    /// The address bound by the server during `login()`, if any.
    pub fn connected_address(&self) -> Option<Jid> {
        self.inner.address.lock().expect("bound address").clone()
    }

    /// Subscribe to lifecycle transitions.
    pub fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to inbound stanzas that are not responses to
    /// [`query`](Session::query): messages, presence and unsolicited
    /// iq requests.
    pub fn stanzas(&self) -> broadcast::Receiver<Stanza> {
        self.inner.stanza_tx.subscribe()
    }

    /// Open a transport and negotiate the stream up to the point just
    /// before authentication.
    ///
    /// Transport candidates from the configuration are tried in order;
    /// the error of the last candidate is returned when all fail.
    pub async fn connect(&self) -> Result<()> {
        self.inner.begin_connecting()?;

        let candidates = if self.inner.config.transports.is_empty() {
            vec![TransportCandidate::Tcp {
                host: self.inner.config.domain.clone(),
                port: XMPP_TCP_PORT,
            }]
        } else {
            self.inner.config.transports.clone()
        };

        let mut last_error = None;
        for candidate in &candidates {
            match self.try_candidate(candidate).await {
                Ok(()) => {
                    self.inner.attempts.store(0, Ordering::SeqCst);
                    self.inner.set_status(SessionStatus::Connected);
                    info!(domain = %self.inner.config.domain, "connected");
                    return Ok(());
                }
                Err(e) => {
                    self.inner.teardown_transport().await;
                    // Only transport-level I/O failure falls through to
                    // the next candidate; a negotiation timeout or stream
                    // error surfaces directly.
                    if !matches!(e, Error::Transport(_) | Error::Io(_)) {
                        self.inner.set_status(SessionStatus::Disconnected);
                        return Err(e);
                    }
                    warn!(?candidate, %e, "transport candidate failed");
                    last_error = Some(e);
                }
            }
        }

        self.inner.set_status(SessionStatus::Disconnected);
        Err(last_error
            .unwrap_or_else(|| Error::Config("no transport candidates configured".to_string())))
    }

    async fn try_candidate(&self, candidate: &TransportCandidate) -> Result<()> {
        let domain = self.inner.config.domain.clone();
        let transport: Arc<dyn Transport> = match candidate {
            TransportCandidate::Tcp { host, port } => {
                let mut tcp = TcpTransport::new(host.clone(), *port, domain);
                if let Some(upgrader) = self.inner.tls.lock().expect("tls upgrader").clone() {
                    tcp = tcp.with_tls_upgrader(upgrader);
                }
                Arc::new(tcp)
            }
            TransportCandidate::Bosh { url } => Arc::new(BoshTransport::new(
                url.clone(),
                domain,
                self.inner.config.bosh.clone(),
            )),
        };
        debug!(transport = transport.name(), "trying transport candidate");

        *self.inner.failure.lock().expect("failure slot") = None;
        self.inner.engine.lock().expect("negotiation engine").reset();
        self.inner.awaiting_restart.store(false, Ordering::SeqCst);
        let epoch_before = self.inner.features_epoch.load(Ordering::SeqCst);

        let deadline = self.inner.config.connect_timeout();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        timeout(deadline, transport.open(event_tx))
            .await
            .map_err(|_| Error::NoResponse)??;

        // Single writer task serializes all outbound elements.
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Element>();
        {
            let inner = self.inner.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                while let Some(element) = write_rx.recv().await {
                    if let Err(e) = transport.send(element).await {
                        inner.fail(e);
                        break;
                    }
                }
            });
        }
        *self.inner.writer.lock().expect("writer") = Some(write_tx);
        *self.inner.transport.lock().expect("transport slot") = Some(transport.clone());

        tokio::spawn(dispatch_loop(self.inner.clone(), event_rx, transport));

        // Resolve once negotiation pauses at authentication or finishes
        // without it.
        timeout(
            deadline,
            self.inner.wait_for(move |inner| {
                if inner.features_epoch.load(Ordering::SeqCst) == epoch_before {
                    return false;
                }
                if inner.awaiting_restart.load(Ordering::SeqCst) {
                    return false;
                }
                let engine = inner.engine.lock().expect("negotiation engine");
                engine.pending_kind() == Some(FeatureKind::Sasl) || engine.is_done()
            }),
        )
        .await
        .map_err(|_| Error::NoResponse)?
    }

    /// Authenticate and bind a server-generated resource.
    pub async fn login(&self, username: &str, password: &str) -> Result<Jid> {
        self.login_with_resource(username, password, None).await
    }

    /// Authenticate and bind, suggesting a resource identifier. The
    /// server may override the suggestion; the returned address is
    /// authoritative.
    pub async fn login_with_resource(
        &self,
        username: &str,
        password: &str,
        resource: Option<&str>,
    ) -> Result<Jid> {
        {
            let status = self.inner.status.lock().expect("session status");
            if *status != SessionStatus::Connected {
                return Err(Error::IllegalState(format!(
                    "login() requires a connected session, status is {:?}",
                    *status
                )));
            }
        }
        self.inner.set_status(SessionStatus::Authenticating);

        match self.authenticate(username, password, resource).await {
            Ok(jid) => {
                *self.inner.credentials.lock().expect("credentials") =
                    Some((username.to_string(), password.to_string()));
                *self.inner.address.lock().expect("bound address") = Some(jid.clone());
                self.inner.set_status(SessionStatus::Authenticated);
                info!(%jid, "authenticated and bound");
                Ok(jid)
            }
            Err(e) => {
                // A login failure keeps the stream open; the caller may
                // retry with different credentials.
                if self.status() == SessionStatus::Authenticating {
                    self.inner.set_status(SessionStatus::Connected);
                }
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        resource: Option<&str>,
    ) -> Result<Jid> {
        let deadline = self.inner.config.connect_timeout();
        let epoch_before = self.inner.features_epoch.load(Ordering::SeqCst);

        let auth = self.inner.sasl.initiate_plain(username, password)?;
        self.inner.send_element(auth)?;
        timeout(deadline, self.inner.sasl.await_result())
            .await
            .map_err(|_| Error::NoResponse)??;

        // Success restarts the stream; wait for the post-authentication
        // advertisement to be fully negotiated.
        timeout(
            deadline,
            self.inner.wait_for(move |inner| {
                inner.features_epoch.load(Ordering::SeqCst) > epoch_before
                    && !inner.awaiting_restart.load(Ordering::SeqCst)
                    && inner.engine.lock().expect("negotiation engine").is_done()
            }),
        )
        .await
        .map_err(|_| Error::NoResponse)??;

        if !self
            .inner
            .engine
            .lock()
            .expect("negotiation engine")
            .saw_bind()
        {
            return Err(Error::Negotiation(
                "server did not advertise resource binding".to_string(),
            ));
        }

        let response = self.query(Iq::set(bind_request(resource))).await?;
        let payload = response
            .payload
            .ok_or_else(|| Error::Login("binding result carries no payload".to_string()))?;
        bound_jid(&payload)
            .ok_or_else(|| Error::Login("binding result carries no address".to_string()))
    }

    /// Send a request stanza and wait for the response correlated by its
    /// id, using the configured default timeout.
    pub async fn query(&self, iq: Iq) -> Result<Iq> {
        self.query_with_timeout(iq, self.inner.config.query_timeout())
            .await
    }

    /// Send a request stanza and wait for its response.
    ///
    /// On timeout the waiter is removed, so a response that arrives late
    /// is dropped by the dispatcher instead of leaking. An error-kind
    /// response is surfaced as [`Error::Stanza`].
    pub async fn query_with_timeout(&self, iq: Iq, wait: Duration) -> Result<Iq> {
        if !iq.kind.is_request() {
            return Err(Error::IllegalState(format!(
                "query() requires a get or set stanza, got {}",
                iq.kind.as_str()
            )));
        }

        let id = iq.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().expect("pending queries");
            if pending.contains_key(&id) {
                return Err(Error::IllegalState(format!(
                    "correlation id {id} is already in flight"
                )));
            }
            pending.insert(id.clone(), tx);
        }

        if let Err(e) = self.inner.send_element(iq.into_element()) {
            self.inner.pending.lock().expect("pending queries").remove(&id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(response)) => {
                if response.kind == IqKind::Error {
                    let error = response
                        .error
                        .unwrap_or_else(|| StanzaError::new("cancel", "undefined-condition"));
                    return Err(Error::Stanza(error));
                }
                Ok(response)
            }
            // Sender dropped: the session was torn down underneath us.
            Ok(Err(_)) => Err(Error::NoResponse),
            Err(_) => {
                self.inner.pending.lock().expect("pending queries").remove(&id);
                Err(Error::NoResponse)
            }
        }
    }

    /// Send a stanza without waiting for anything.
    pub fn send(&self, stanza: Stanza) -> Result<()> {
        let element = match stanza {
            Stanza::Iq(iq) => iq.into_element(),
            Stanza::Message(el) | Stanza::Presence(el) => el,
        };
        self.inner.send_element(element)
    }

    /// Send a raw element. Escape hatch for extension traffic the typed
    /// stanza layer does not model.
    pub fn send_element(&self, element: Element) -> Result<()> {
        self.inner.send_element(element)
    }

    /// Report a connection-level failure, as a transport integration
    /// would. Releases lifecycle waiters and schedules reconnection
    /// according to the policy.
    pub fn notify_failure(&self, error: Error) {
        self.inner.fail(error);
    }

    /// Close the session for good. Idempotent; afterwards the session is
    /// terminal and `connect()` fails.
    pub async fn close(&self) -> Result<()> {
        if self.status() == SessionStatus::Closed {
            return Ok(());
        }
        self.inner.set_status(SessionStatus::Closing);
        self.inner.teardown_transport().await;
        self.inner.set_status(SessionStatus::Closed);
        Ok(())
    }

    async fn reconnect_once(&self) -> Result<()> {
        self.connect().await?;
        let credentials = self.inner.credentials.lock().expect("credentials").clone();
        if let Some((username, password)) = credentials {
            self.login(&username, &password).await?;
        }
        Ok(())
    }
}

impl Inner {
    /// Verify the session may connect and enter `Connecting`, as one
    /// atomic step: of two racing `connect()` calls, exactly one passes.
    fn begin_connecting(&self) -> Result<()> {
        let from = {
            let mut status = self.status.lock().expect("session status");
            match *status {
                SessionStatus::Initial | SessionStatus::Disconnected => {}
                SessionStatus::Closed => {
                    return Err(Error::IllegalState(
                        "session is closed and cannot reconnect".to_string(),
                    ));
                }
                other => {
                    return Err(Error::IllegalState(format!(
                        "connect() called while {other:?}"
                    )));
                }
            }
            let from = *status;
            *status = SessionStatus::Connecting;
            from
        };
        debug!(?from, to = ?SessionStatus::Connecting, "status change");
        let _ = self.status_tx.send(StatusChange {
            from,
            to: SessionStatus::Connecting,
            cause: None,
        });
        self.progress.notify_waiters();
        Ok(())
    }

    fn set_status(&self, to: SessionStatus) {
        self.set_status_caused(to, None);
    }

    fn set_status_caused(&self, to: SessionStatus, cause: Option<String>) {
        let from = {
            let mut status = self.status.lock().expect("session status");
            let from = *status;
            *status = to;
            from
        };
        if from != to {
            debug!(?from, ?to, "status change");
            let _ = self.status_tx.send(StatusChange { from, to, cause });
        }
        self.progress.notify_waiters();
    }

    fn send_element(&self, element: Element) -> Result<()> {
        let writer = self.writer.lock().expect("writer");
        match writer.as_ref() {
            Some(tx) => tx
                .send(element)
                .map_err(|_| Error::Transport("writer task stopped".to_string())),
            None => Err(Error::IllegalState(
                "session has no open transport".to_string(),
            )),
        }
    }

    /// Wait until `ready` holds or a connection failure is recorded.
    async fn wait_for(&self, ready: impl Fn(&Inner) -> bool) -> Result<()> {
        loop {
            let notified = self.progress.notified();
            if let Some(error) = self.failure.lock().expect("failure slot").as_ref() {
                return Err(error.duplicate());
            }
            if ready(self) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn teardown_transport(&self) {
        *self.writer.lock().expect("writer") = None;
        let transport = self.transport.lock().expect("transport slot").take();
        if let Some(transport) = transport {
            let _ = transport.close().await;
            let _ = timeout(Duration::from_secs(5), transport.wait_closed()).await;
        }
    }

    /// Record an unrecoverable connection failure.
    ///
    /// Releases `connect()`/`login()` waiters through the failure slot.
    /// Pending queries are left untouched and run into their own
    /// timeouts. Schedules reconnection unless the policy forbids it.
    fn fail(self: &Arc<Self>, error: Error) {
        let status = *self.status.lock().expect("session status");
        match status {
            SessionStatus::Closing | SessionStatus::Closed => return,
            SessionStatus::Connecting | SessionStatus::Initial | SessionStatus::Disconnected => {
                // The candidate loop owns fallback during connect; just
                // surface the failure to the waiter.
                *self.failure.lock().expect("failure slot") = Some(error);
                self.progress.notify_waiters();
                return;
            }
            _ => {}
        }

        warn!(%error, "connection failed");
        *self.failure.lock().expect("failure slot") = Some(error.duplicate());
        *self.writer.lock().expect("writer") = None;
        if let Some(transport) = self.transport.lock().expect("transport slot").take() {
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
        self.set_status_caused(SessionStatus::Disconnected, Some(error.to_string()));

        let policy = self.reconnect.lock().expect("reconnect policy").clone();
        if !policy.may_reconnect(&error) {
            if error.is_conflict() {
                info!("session replaced by another connection, not reconnecting");
            }
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let session = Session {
                inner: inner.clone(),
            };
            loop {
                let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = policy.delay(attempt, &error);
                info!(attempt, ?delay, "reconnecting after backoff");
                tokio::time::sleep(delay).await;

                if *inner.status.lock().expect("session status") != SessionStatus::Disconnected {
                    break;
                }
                match session.reconnect_once().await {
                    Ok(()) => break,
                    Err(e) => warn!(attempt, %e, "reconnect attempt failed"),
                }
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn handle_element(
        self: &Arc<Self>,
        element: &Element,
        transport: &Arc<dyn Transport>,
    ) -> Result<()> {
        if element.name() == "stream:error" {
            let error = stream_error(element);
            warn!(%error, "stream error received");
            self.fail(error);
            let _ = transport.close().await;
            return Ok(());
        }

        if element.local_name() == "features" {
            let step = self
                .engine
                .lock()
                .expect("negotiation engine")
                .handle_features(element)?;
            self.awaiting_restart.store(false, Ordering::SeqCst);
            self.features_epoch.fetch_add(1, Ordering::SeqCst);
            self.apply_step(step, transport).await?;
            self.progress.notify_waiters();
            return Ok(());
        }

        let step = self
            .engine
            .lock()
            .expect("negotiation engine")
            .process_element(element)?;
        if let Some(step) = step {
            self.apply_step(step, transport).await?;
            self.progress.notify_waiters();
            return Ok(());
        }

        match Stanza::from_element(element) {
            Some(Stanza::Iq(iq)) if !iq.kind.is_request() => {
                let waiter = self.pending.lock().expect("pending queries").remove(&iq.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(iq);
                    }
                    // Waiter timed out or never existed: drop silently.
                    None => trace!(id = %iq.id, "unmatched response dropped"),
                }
            }
            Some(stanza) => {
                let _ = self.stanza_tx.send(stanza);
            }
            None => trace!(name = element.name(), "unrecognized element ignored"),
        }
        Ok(())
    }

    async fn apply_step(&self, step: EngineStep, transport: &Arc<dyn Transport>) -> Result<()> {
        for element in step.sends {
            self.send_element(element)?;
        }
        if step.restart {
            if let Some(directive) = step.directive {
                match directive {
                    TransportDirective::Secure => transport.secure().await?,
                    TransportDirective::Compress(method) => transport.compress(method).await?,
                }
            }
            self.awaiting_restart.store(true, Ordering::SeqCst);
            self.engine.lock().expect("negotiation engine").reset();
            transport.restart_stream().await?;
        }
        Ok(())
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut events: EventReceiver,
    transport: Arc<dyn Transport>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Header(header) => {
                trace!(id = header.get_attr("id").unwrap_or(""), "stream header");
            }
            TransportEvent::Element { element, .. } => {
                if let Err(e) = inner.handle_element(&element, &transport).await {
                    inner.fail(e);
                    let _ = transport.close().await;
                    break;
                }
            }
            TransportEvent::StreamClosed => {
                inner.fail(Error::Transport("stream closed by server".to_string()));
                break;
            }
            TransportEvent::Failed(error) => {
                inner.fail(error);
                break;
            }
        }
    }
    trace!("dispatch loop ended");
}

/// Decode a `<stream:error/>` into its condition and optional text.
fn stream_error(element: &Element) -> Error {
    let condition = element
        .children()
        .find(|c| c.local_name() != "text")
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .find_child_ns("text", NS_STREAM_ERRORS)
        .or_else(|| element.find_child("text"))
        .map(|t| t.content());
    Error::Stream { condition, text }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionConfig::for_domain("example.org"))
    }

    #[test]
    fn test_initial_status() {
        let session = session();
        assert_eq!(session.status(), SessionStatus::Initial);
        assert!(session.connected_address().is_none());
    }

    #[tokio::test]
    async fn test_query_requires_request_kind() {
        let session = session();
        let mut iq = Iq::get(Element::new("query"));
        iq.kind = IqKind::Result;
        let err = session.query(iq).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_query_without_transport_is_illegal_state() {
        let session = session();
        let err = session.query(Iq::get(Element::new("ping"))).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        // The failed send must not leak its waiter.
        assert!(session.inner.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_transport_is_illegal_state() {
        let session = session();
        let err = session
            .send(Stanza::Message(Element::new("message")))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_login_requires_connected() {
        let session = session();
        let err = session.login("alice", "secret").await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn test_second_connect_guard_rejects_while_connecting() {
        let session = session();
        session.inner.begin_connecting().unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);

        // Check and transition are one step: a concurrent connect()
        // always observes Connecting and fails.
        let err = session.inner.begin_connecting().unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_connect_after_close_is_illegal_state() {
        let session = session();
        session.close().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Closed);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_status_changes_are_broadcast() {
        let session = session();
        let mut changes = session.status_changes();
        session.close().await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.from, SessionStatus::Initial);
        assert_eq!(change.to, SessionStatus::Closing);
        let change = changes.recv().await.unwrap();
        assert_eq!(change.to, SessionStatus::Closed);
    }

    #[test]
    fn test_stream_error_decoding() {
        let element = Element::parse(concat!(
            "<stream:error>",
            "<conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>",
            "<text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>replaced</text>",
            "</stream:error>"
        ))
        .unwrap();

        let error = stream_error(&element);
        assert!(error.is_conflict());
        assert!(matches!(
            error,
            Error::Stream { text: Some(t), .. } if t == "replaced"
        ));
    }

    #[test]
    fn test_stream_error_without_condition() {
        let element = Element::parse("<stream:error/>").unwrap();
        let error = stream_error(&element);
        assert!(matches!(
            error,
            Error::Stream { condition, .. } if condition == "undefined-condition"
        ));
    }
}
