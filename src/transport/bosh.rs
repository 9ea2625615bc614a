//! Reliable long-polling HTTP transport (BOSH).
//!
//! Emulates a duplex stream over discrete HTTP request/response pairs:
//! every request carries a strictly incrementing `rid`, responses
//! acknowledge requests, unacknowledged requests are kept for
//! retransmission, and at most a server-advertised number of requests is
//! held open at once. An empty "hold the line" request keeps one request
//! parked at the server whenever nothing else is outstanding.
//!
//! The protocol bookkeeping lives in [`BoshEngine`], which is pure state
//! (no I/O) so the ordering, acknowledgment and anti-flood rules can be
//! exercised directly. [`BoshTransport`] wraps it with a `reqwest` client
//! and a single in-order dispatcher task: requests are issued in `rid`
//! order even though their HTTP round trips overlap and responses may
//! complete out of order.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use super::{CompressionMethod, EventSender, Transport, TransportEvent};
use crate::config::BoshConfig;
use crate::error::{Error, Result};
use crate::xml::Element;

/// Namespace of the HTTP binding wrapper element.
pub const NS_HTTPBIND: &str = "http://jabber.org/protocol/httpbind";
const NS_XBOSH: &str = "urn:xmpp:xbosh";

/// Content encodings this client can produce for request bodies.
const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "deflate"];

/// A prepared request: its `rid` and the wrapper body to POST.
#[derive(Debug, Clone)]
pub struct BoshRequest {
    /// Request id. Retransmissions reuse the original value.
    pub rid: u64,
    /// Complete `<body/>` wrapper.
    pub body: Element,
}

/// What the caller must do after the engine consumed a response.
#[derive(Debug)]
pub enum BoshAction {
    /// The session was created; the element is the creation response,
    /// surfaced as the stream header equivalent.
    Opened(Element),
    /// A payload element to hand to the session.
    Deliver(Element),
    /// The connection manager asked for a resend: dispatch these again,
    /// in order, with their original rids.
    Retransmit(Vec<BoshRequest>),
    /// The remote ended the stream in an orderly way.
    StreamClosed,
    /// Unrecoverable failure; the whole BOSH session is over.
    Fatal(Error),
}

/// Kind of request being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary payload (possibly empty long-poll) request.
    Normal,
    /// Ask the connection manager to hold traffic for this many seconds.
    Pause(u16),
    /// Stream restart marker (`xmpp:restart='true'`).
    Restart,
    /// Session termination.
    Terminate,
}

/// Outcome of a flush attempt.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing to send right now; unsent elements are handed back.
    Declined(Vec<Element>),
    /// A request to dispatch.
    Request(BoshRequest),
}

/// Pre-computed one-way-hash tokens for request replay protection.
///
/// A sequence is built by hashing a random seed `n` times and keeping
/// every intermediate digest; requests present the digests in reverse
/// order so the server can verify each key hashes into the previous one.
#[derive(Debug, Default)]
pub struct KeySequence {
    stack: Vec<String>,
    primed: bool,
}

impl KeySequence {
    /// Create an empty, ungenerated sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the `key`/`newkey` attribute values for the next request,
    /// generating a fresh sequence when the stack runs out.
    pub fn next_attrs<R: Rng>(&mut self, rng: &mut R) -> (Option<String>, Option<String>) {
        if !self.primed {
            self.generate(rng);
            self.primed = true;
            return (None, self.stack.pop());
        }
        let key = self.stack.pop();
        let mut newkey = None;
        if self.stack.is_empty() {
            self.generate(rng);
            newkey = self.stack.pop();
        }
        (key, newkey)
    }

    /// Number of keys left before a regeneration.
    pub fn remaining(&self) -> usize {
        self.stack.len()
    }

    fn generate<R: Rng>(&mut self, rng: &mut R) {
        let mut seed = [0u8; 32];
        rng.fill(&mut seed);
        let count = rng.gen_range(64..256);

        let mut digest = hex::encode(Sha256::digest(seed));
        self.stack.clear();
        self.stack.reserve(count);
        for _ in 0..count {
            digest = hex::encode(Sha256::digest(digest.as_bytes()));
            self.stack.push(digest.clone());
        }
    }
}

/// Protocol bookkeeping for one BOSH session. Pure state, no I/O.
pub struct BoshEngine {
    domain: String,
    config: BoshConfig,
    sid: Option<String>,
    rid: u64,
    hold: usize,
    requests_limit: usize,
    wait: u16,
    ack_enabled: bool,
    outstanding: usize,
    last_request_empty: bool,
    shutdown: bool,
    highest_received: Option<u64>,
    unacked: BTreeMap<u64, Element>,
    encoding: Option<&'static str>,
    maxpause: Option<u16>,
}

impl BoshEngine {
    /// Create an engine with a randomly seeded request counter.
    pub fn new(domain: impl Into<String>, config: BoshConfig) -> Self {
        // Large random seed: reduces rid collision risk across reconnects
        // reusing the same session identity, while leaving room to
        // increment without overflowing 2^53.
        let seed = rand::thread_rng().gen_range(1u64 << 20..1u64 << 50);
        Self::with_rid_seed(domain, config, seed)
    }

    /// Create an engine with a fixed request counter seed.
    pub fn with_rid_seed(domain: impl Into<String>, config: BoshConfig, seed: u64) -> Self {
        let hold = usize::from(config.hold.max(1));
        Self {
            domain: domain.into(),
            wait: config.wait,
            config,
            sid: None,
            rid: seed,
            hold,
            requests_limit: hold + 1,
            ack_enabled: false,
            outstanding: 0,
            last_request_empty: false,
            shutdown: false,
            highest_received: None,
            unacked: BTreeMap::new(),
            encoding: None,
            maxpause: None,
        }
    }

    /// Server-assigned session id, once established.
    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    /// Whether the server enabled the acknowledgment sub-protocol.
    pub fn ack_enabled(&self) -> bool {
        self.ack_enabled
    }

    /// Content encoding chosen for request bodies, if any.
    pub fn encoding(&self) -> Option<&'static str> {
        self.encoding
    }

    /// Longest pause the connection manager allows, if it supports
    /// pausing at all.
    pub fn max_pause(&self) -> Option<u16> {
        self.maxpause
    }

    /// Requests dispatched but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// rids awaiting acknowledgment, in order.
    pub fn unacked_rids(&self) -> Vec<u64> {
        self.unacked.keys().copied().collect()
    }

    /// Whether an empty long-poll should be scheduled: session live and
    /// nothing parked at the server.
    pub fn needs_poll(&self) -> bool {
        !self.shutdown && self.sid.is_some() && self.outstanding == 0
    }

    /// Whether the session has been shut down (terminated or detached).
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Build the session creation request (no `sid` yet; advertises
    /// `hold`/`wait` and the protocol version).
    pub fn session_request(&mut self, keys: Option<&mut KeySequence>) -> BoshRequest {
        let rid = self.take_rid();
        let mut body = Element::new("body")
            .attr("xmlns", NS_HTTPBIND)
            .attr("rid", rid.to_string())
            .attr("to", self.domain.clone())
            .attr("wait", self.wait.to_string())
            .attr("hold", self.hold.to_string())
            .attr("ver", "1.6")
            .attr("xml:lang", "en")
            .attr("xmlns:xmpp", NS_XBOSH)
            .attr("xmpp:version", "1.0");
        self.attach_keys(&mut body, keys);
        self.outstanding += 1;
        self.last_request_empty = false;
        BoshRequest { rid, body }
    }

    /// Try to build the next request. Declines when sending would break
    /// the concurrency limit or the anti-flood rule.
    pub fn next_request(
        &mut self,
        elements: Vec<Element>,
        kind: RequestKind,
        keys: Option<&mut KeySequence>,
    ) -> FlushOutcome {
        if self.shutdown || self.sid.is_none() {
            return FlushOutcome::Declined(elements);
        }

        if let RequestKind::Pause(seconds) = kind {
            match self.maxpause {
                Some(max) if seconds <= max => {}
                _ => return FlushOutcome::Declined(elements),
            }
        }

        if kind == RequestKind::Normal && elements.is_empty() {
            if self.outstanding >= self.hold {
                return FlushOutcome::Declined(elements);
            }
            // Two consecutive empty requests get clients flagged as
            // abusive; hold the line request waits for the next payload.
            if self.last_request_empty {
                return FlushOutcome::Declined(elements);
            }
        } else if kind == RequestKind::Normal && self.outstanding >= self.requests_limit {
            return FlushOutcome::Declined(elements);
        }

        let rid = self.take_rid();
        let mut body = Element::new("body")
            .attr("xmlns", NS_HTTPBIND)
            .attr("rid", rid.to_string())
            .attr("sid", self.sid.clone().unwrap_or_default());

        if self.ack_enabled {
            // Acknowledge the highest answered rid, unless the server has
            // already answered everything we sent.
            let all_answered = self.unacked.is_empty() && self.outstanding == 0;
            if let (false, Some(highest)) = (all_answered, self.highest_received) {
                body.set_attr("ack", highest.to_string());
            }
        }

        match kind {
            RequestKind::Normal => {}
            RequestKind::Pause(seconds) => {
                body.set_attr("pause", seconds.to_string());
            }
            RequestKind::Restart => {
                body.set_attr("xmlns:xmpp", NS_XBOSH);
                body.set_attr("xmpp:restart", "true");
                body.set_attr("to", self.domain.clone());
            }
            RequestKind::Terminate => {
                body.set_attr("type", "terminate");
            }
        }

        self.attach_keys(&mut body, keys);

        let empty = elements.is_empty();
        for element in elements {
            body.push_child(element);
        }

        if self.ack_enabled && kind != RequestKind::Terminate {
            self.unacked.insert(rid, body.clone());
        }
        self.outstanding += 1;
        self.last_request_empty = empty && kind == RequestKind::Normal;
        if kind == RequestKind::Terminate {
            self.shutdown = true;
        }

        trace!(rid, ?kind, empty, "bosh request prepared");
        FlushOutcome::Request(BoshRequest { rid, body })
    }

    /// Consume the response to request `rid`.
    pub fn handle_response(&mut self, rid: u64, body: &Element) -> Vec<BoshAction> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.highest_received = Some(self.highest_received.map_or(rid, |h| h.max(rid)));

        // The response is always an acknowledgment of its own request.
        self.unacked.remove(&rid);

        if body.local_name() != "body" || body.namespace() != Some(NS_HTTPBIND) {
            self.shutdown = true;
            return vec![BoshAction::Fatal(Error::Transport(
                "malformed BOSH response wrapper".to_string(),
            ))];
        }

        // A response-level ack confirms an earlier request separately.
        if let Some(acked) = body.get_attr("ack").and_then(|a| a.parse::<u64>().ok()) {
            self.unacked.remove(&acked);
        }

        let mut actions = Vec::new();

        if self.sid.is_none() {
            match body.get_attr("sid") {
                Some(sid) => {
                    self.sid = Some(sid.to_string());
                    if let Some(requests) = body.get_attr("requests").and_then(|r| r.parse().ok())
                    {
                        self.requests_limit = requests;
                    }
                    if let Some(hold) = body.get_attr("hold").and_then(|h| h.parse().ok()) {
                        self.hold = hold;
                    }
                    if let Some(wait) = body.get_attr("wait").and_then(|w| w.parse().ok()) {
                        self.wait = wait;
                    }
                    // An ack attribute on the creation response enables
                    // the reliability sub-protocol.
                    self.ack_enabled = body.get_attr("ack").is_some();
                    self.encoding = body.get_attr("accept").and_then(pick_encoding);
                    self.maxpause = body.get_attr("maxpause").and_then(|m| m.parse().ok());
                    debug!(
                        sid = %sid,
                        ack = self.ack_enabled,
                        requests = self.requests_limit,
                        encoding = ?self.encoding,
                        "bosh session established"
                    );
                    actions.push(BoshAction::Opened(body.clone()));
                }
                None => {
                    self.shutdown = true;
                    return vec![BoshAction::Fatal(Error::Transport(
                        "BOSH session creation response carries no sid".to_string(),
                    ))];
                }
            }
        }

        match body.get_attr("type") {
            Some("terminate") => {
                let condition = body.get_attr("condition").unwrap_or("unspecified");
                if condition == "remote-stream-error" {
                    // The stream error rides in the body; surface it and
                    // let the session classify it.
                    actions.extend(body.children().cloned().map(BoshAction::Deliver));
                    actions.push(BoshAction::StreamClosed);
                    self.shutdown = true;
                } else {
                    self.shutdown = true;
                    actions.push(BoshAction::Fatal(Error::Transport(format!(
                        "BOSH session terminated: {condition}"
                    ))));
                }
            }
            Some("error") => {
                // Recoverable: resend everything unacknowledged with the
                // original rids, since the server identifies requests by rid.
                let resend: Vec<BoshRequest> = self
                    .unacked
                    .iter()
                    .map(|(&rid, body)| BoshRequest {
                        rid,
                        body: body.clone(),
                    })
                    .collect();
                warn!(count = resend.len(), "bosh recoverable error, retransmitting");
                self.outstanding += resend.len();
                actions.push(BoshAction::Retransmit(resend));
            }
            _ => {
                actions.extend(body.children().cloned().map(BoshAction::Deliver));
            }
        }

        actions
    }

    /// Release the transport without terminating the remote session,
    /// returning the last used rid so another client can resume.
    pub fn detach(&mut self) -> u64 {
        self.shutdown = true;
        self.rid - 1
    }

    fn take_rid(&mut self) -> u64 {
        let rid = self.rid;
        self.rid += 1;
        rid
    }

    fn attach_keys(&mut self, body: &mut Element, keys: Option<&mut KeySequence>) {
        if !self.config.use_key_sequence {
            return;
        }
        if let Some(keys) = keys {
            let (key, newkey) = keys.next_attrs(&mut rand::thread_rng());
            if let Some(key) = key {
                body.set_attr("key", key);
            }
            if let Some(newkey) = newkey {
                body.set_attr("newkey", newkey);
            }
        }
    }
}

/// First server-offered encoding we can produce.
fn pick_encoding(accept: &str) -> Option<&'static str> {
    accept
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .find_map(|offered| {
            SUPPORTED_ENCODINGS
                .iter()
                .find(|s| s.eq_ignore_ascii_case(offered))
                .copied()
        })
}

struct BoshShared {
    url: String,
    http: reqwest::Client,
    poll_delay: Duration,
    engine: StdMutex<BoshEngine>,
    pending: StdMutex<Vec<Element>>,
    keys: StdMutex<KeySequence>,
    events: StdMutex<Option<EventSender>>,
    dispatch: StdMutex<Option<mpsc::UnboundedSender<BoshRequest>>>,
    opened: StdMutex<Option<oneshot::Sender<Result<()>>>>,
    closed: Notify,
    is_closed: AtomicBool,
}

impl BoshShared {
    fn emit(&self, event: TransportEvent) {
        if let Some(sender) = self.events.lock().expect("event sender").as_ref() {
            let _ = sender.send(event);
        }
    }

    fn fail(&self, error: Error) {
        if let Some(tx) = self.opened.lock().expect("open waiter").take() {
            let _ = tx.send(Err(error.duplicate()));
        }
        self.emit(TransportEvent::Failed(error));
        self.mark_closed();
    }

    fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }

    fn dispatch(&self, request: BoshRequest) {
        if let Some(tx) = self.dispatch.lock().expect("dispatcher").as_ref() {
            let _ = tx.send(request);
        }
    }

    /// Drain pending payload into a request if protocol policy allows.
    fn flush(self: &Arc<Self>, kind: RequestKind) {
        let elements = match kind {
            RequestKind::Restart => Vec::new(),
            _ => std::mem::take(&mut *self.pending.lock().expect("pending buffer")),
        };

        // rid assignment and dispatcher enqueue happen under one engine
        // lock acquisition: concurrent flushes (writer task, poll timer)
        // must not enqueue out of rid order. The dispatch channel send is
        // non-blocking, so the lock is never held across a wait.
        let unsent = {
            let mut engine = self.engine.lock().expect("bosh engine");
            let mut keys = self.keys.lock().expect("key sequence");
            match engine.next_request(elements, kind, Some(&mut keys)) {
                FlushOutcome::Request(request) => {
                    self.dispatch(request);
                    Vec::new()
                }
                FlushOutcome::Declined(unsent) => unsent,
            }
        };

        if !unsent.is_empty() {
            let mut pending = self.pending.lock().expect("pending buffer");
            // Returned elements go back in front of anything queued
            // meanwhile, preserving submission order.
            let queued = std::mem::take(&mut *pending);
            *pending = unsent.into_iter().chain(queued).collect();
        }
    }

    fn schedule_poll_if_idle(self: &Arc<Self>) {
        let needs_poll = self.engine.lock().expect("bosh engine").needs_poll();
        if !needs_poll {
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            // Brief window for the application to piggyback payload
            // before the empty long-poll goes out.
            tokio::time::sleep(shared.poll_delay).await;
            shared.flush(RequestKind::Normal);
        });
    }

    async fn round_trip(self: Arc<Self>, request: BoshRequest) {
        let encoding = self.engine.lock().expect("bosh engine").encoding();
        let xml = request.body.to_xml();

        let mut builder = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml; charset=utf-8");
        builder = match encoding.map(|e| (e, encode_body(e, xml.as_bytes()))) {
            Some((name, Ok(encoded))) => builder.header("Content-Encoding", name).body(encoded),
            _ => builder.body(xml),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.fail(Error::Transport(format!("bosh request failed: {e}")));
                return;
            }
        };
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                self.fail(Error::Transport(format!("bosh response read failed: {e}")));
                return;
            }
        };
        let body = match Element::parse(&text) {
            Ok(body) => body,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let actions = self
            .engine
            .lock()
            .expect("bosh engine")
            .handle_response(request.rid, &body);

        for action in actions {
            match action {
                BoshAction::Opened(header) => {
                    if let Some(tx) = self.opened.lock().expect("open waiter").take() {
                        let _ = tx.send(Ok(()));
                    }
                    self.emit(TransportEvent::Header(header));
                }
                BoshAction::Deliver(element) => {
                    let raw = element.to_xml();
                    self.emit(TransportEvent::Element { raw, element });
                }
                BoshAction::Retransmit(requests) => {
                    for request in requests {
                        self.dispatch(request);
                    }
                }
                BoshAction::StreamClosed => {
                    self.emit(TransportEvent::StreamClosed);
                    self.mark_closed();
                }
                BoshAction::Fatal(error) => {
                    self.fail(error);
                    return;
                }
            }
        }

        self.schedule_poll_if_idle();
    }
}

/// Reliable long-polling transport over HTTP.
pub struct BoshTransport {
    shared: Arc<BoshShared>,
}

impl BoshTransport {
    /// Create a transport posting to `url` for the given stream domain.
    pub fn new(url: impl Into<String>, domain: impl Into<String>, config: BoshConfig) -> Self {
        let poll_delay = config.poll_delay();
        Self {
            shared: Arc::new(BoshShared {
                url: url.into(),
                http: reqwest::Client::new(),
                poll_delay,
                engine: StdMutex::new(BoshEngine::new(domain, config)),
                pending: StdMutex::new(Vec::new()),
                keys: StdMutex::new(KeySequence::new()),
                events: StdMutex::new(None),
                dispatch: StdMutex::new(None),
                opened: StdMutex::new(None),
                closed: Notify::new(),
                is_closed: AtomicBool::new(false),
            }),
        }
    }

    /// Ask the connection manager to hold traffic for `seconds`. Ignored
    /// when the server advertised no pause support or the request exceeds
    /// its limit.
    pub fn pause(&self, seconds: u16) {
        self.shared.flush(RequestKind::Pause(seconds));
    }

    /// Release the transport without terminating the remote session,
    /// returning the last used rid for a later resume.
    pub fn detach(&self) -> u64 {
        let rid = self.shared.engine.lock().expect("bosh engine").detach();
        *self.shared.dispatch.lock().expect("dispatcher") = None;
        self.shared.mark_closed();
        rid
    }
}

#[async_trait::async_trait]
impl Transport for BoshTransport {
    async fn open(&self, events: EventSender) -> Result<()> {
        *self.shared.events.lock().expect("event sender") = Some(events);
        self.shared.is_closed.store(false, Ordering::SeqCst);

        // Single in-order dispatcher: requests hit the wire in rid order
        // even though their round trips run concurrently.
        let (tx, mut rx) = mpsc::unbounded_channel::<BoshRequest>();
        *self.shared.dispatch.lock().expect("dispatcher") = Some(tx);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                tokio::spawn(shared.clone().round_trip(request));
            }
        });

        let (opened_tx, opened_rx) = oneshot::channel();
        *self.shared.opened.lock().expect("open waiter") = Some(opened_tx);

        let request = {
            let mut engine = self.shared.engine.lock().expect("bosh engine");
            let mut keys = self.shared.keys.lock().expect("key sequence");
            engine.session_request(Some(&mut keys))
        };
        self.shared.dispatch(request);

        opened_rx
            .await
            .map_err(|_| Error::Transport("bosh transport closed during open".to_string()))?
    }

    async fn send(&self, element: Element) -> Result<()> {
        if self.shared.engine.lock().expect("bosh engine").is_shutdown() {
            return Err(super::not_open());
        }
        self.shared.pending.lock().expect("pending buffer").push(element);
        self.shared.flush(RequestKind::Normal);
        Ok(())
    }

    async fn secure(&self) -> Result<()> {
        // Channel security for the HTTP binding is HTTPS, established per
        // request; there is nothing to upgrade mid-session.
        Err(Error::Transport(
            "BOSH channel security is provided by HTTPS".to_string(),
        ))
    }

    async fn compress(&self, _method: CompressionMethod) -> Result<()> {
        Err(Error::Transport(
            "BOSH bodies use HTTP content encoding, not stream compression".to_string(),
        ))
    }

    async fn restart_stream(&self) -> Result<()> {
        self.shared.flush(RequestKind::Restart);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.flush(RequestKind::Terminate);
        self.shared.mark_closed();
        Ok(())
    }

    async fn wait_closed(&self) {
        while !self.shared.is_closed.load(Ordering::SeqCst) {
            self.shared.closed.notified().await;
        }
    }

    fn name(&self) -> &'static str {
        "bosh"
    }
}

/// Apply an HTTP content encoding to a request body.
fn encode_body(encoding: &str, body: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        "deflate" => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        other => Err(Error::Transport(format!("unsupported encoding {other}"))),
    }
}
