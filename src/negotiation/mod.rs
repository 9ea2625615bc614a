//! Stream feature negotiation.
//!
//! On every features advertisement the engine filters the advertised list
//! down to known kinds, orders it (voluntary-to-negotiate before
//! mandatory-to-negotiate, stable within each group) and drives the queue
//! front-to-back, one feature in flight at a time. Negotiators are small
//! per-feature state machines plugged in through the [`Negotiator`] trait;
//! a failed negotiator skips its feature without aborting the handshake.
//!
//! Restarts (after TLS, SASL or compression) are propagated to the caller
//! instead of auto-advancing: the caller restarts the decoder and the
//! engine waits for a fresh advertisement.

mod compress;
mod sasl;
mod tls;

pub use compress::CompressionNegotiator;
pub use sasl::SaslNegotiator;
pub use tls::StartTlsNegotiator;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::Result;
use crate::transport::CompressionMethod;
use crate::xml::Element;

/// Namespace of the STARTTLS feature and handshake elements.
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// Namespace of the SASL feature and handshake elements.
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// Namespace of the compression feature advertisement.
pub const NS_COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
/// Namespace of the compression handshake elements.
pub const NS_COMPRESS: &str = "http://jabber.org/protocol/compress";
/// Namespace of the legacy session feature.
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Closed set of negotiable feature kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    /// Stream encryption (`<starttls/>`).
    StartTls,
    /// Authentication mechanisms (`<mechanisms/>`).
    Sasl,
    /// Stream compression (`<compression/>`).
    Compression,
    /// Resource binding (`<bind/>`). No negotiator: binding is performed
    /// as a synchronous request by `login()`.
    Bind,
    /// Legacy session establishment (`<session/>`).
    Session,
}

impl FeatureKind {
    /// Classify a features-advertisement child element.
    pub fn classify(element: &Element) -> Option<FeatureKind> {
        match (element.local_name(), element.namespace()) {
            ("starttls", Some(NS_TLS)) => Some(FeatureKind::StartTls),
            ("mechanisms", Some(NS_SASL)) => Some(FeatureKind::Sasl),
            ("compression", Some(NS_COMPRESS_FEATURE)) => Some(FeatureKind::Compression),
            ("bind", Some(crate::stanza::NS_BIND)) => Some(FeatureKind::Bind),
            ("session", Some(NS_SESSION)) => Some(FeatureKind::Session),
            _ => None,
        }
    }
}

/// One advertised feature awaiting negotiation.
#[derive(Debug, Clone)]
pub struct StreamFeature {
    /// Which feature this is.
    pub kind: FeatureKind,
    /// Mandatory-to-negotiate: must complete before the session proceeds.
    pub mandatory: bool,
    /// The advertisement element, kept for the negotiator.
    pub payload: Element,
}

impl StreamFeature {
    /// Decode an advertisement child, returning `None` for unknown kinds.
    pub fn from_element(element: &Element) -> Option<StreamFeature> {
        let kind = FeatureKind::classify(element)?;
        let mandatory = match kind {
            // Authentication is always mandatory-to-negotiate.
            FeatureKind::Sasl => true,
            // Legacy session is mandatory unless explicitly optional.
            FeatureKind::Session => element.find_child("optional").is_none(),
            _ => element.find_child("required").is_some(),
        };
        Some(StreamFeature {
            kind,
            mandatory,
            payload: element.clone(),
        })
    }
}

/// Result of a negotiator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// More protocol exchange is needed; the engine pauses.
    Incomplete,
    /// The feature is negotiated.
    Success,
    /// The feature is declined or unsupported; the engine skips it.
    Failure,
}

/// A negotiator step outcome plus the element to send, if any.
#[derive(Debug, Clone)]
pub struct NegotiationReply {
    /// State machine outcome.
    pub outcome: NegotiationOutcome,
    /// Element to write to the stream.
    pub send: Option<Element>,
}

impl NegotiationReply {
    /// An outcome with nothing to send.
    pub fn of(outcome: NegotiationOutcome) -> Self {
        Self {
            outcome,
            send: None,
        }
    }

    /// An outcome accompanied by an outbound element.
    pub fn sending(outcome: NegotiationOutcome, element: Element) -> Self {
        Self {
            outcome,
            send: Some(element),
        }
    }
}

/// Transport operation to perform after a negotiator succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirective {
    /// Upgrade the channel to TLS.
    Secure,
    /// Enable stream compression with the negotiated method.
    Compress(CompressionMethod),
}

/// Per-feature negotiation state machine.
///
/// Implementations are created once at session construction, registered
/// with the engine, and reused across reconnects; a fresh advertisement
/// implicitly resets them.
pub trait Negotiator: Send + Sync {
    /// The feature kind this negotiator handles.
    fn kind(&self) -> FeatureKind;

    /// Consume a feature advertisement or handshake element.
    fn process(&self, element: &Element) -> Result<NegotiationReply>;

    /// Whether success requires a stream restart.
    fn needs_restart(&self) -> bool;

    /// Whether this negotiator owns the given mid-handshake element
    /// (e.g. a `<proceed/>` belongs to the encryption handshake).
    fn can_claim(&self, element: &Element) -> bool;

    /// Transport operation to apply once this negotiator succeeds.
    fn transport_directive(&self) -> Option<TransportDirective> {
        None
    }
}

/// What the session must do after an engine step.
#[derive(Debug, Default)]
pub struct EngineStep {
    /// Elements to write to the stream, in order.
    pub sends: Vec<Element>,
    /// A stream restart is required before negotiation continues.
    pub restart: bool,
    /// Transport operation to apply before the restart.
    pub directive: Option<TransportDirective>,
}

/// Orders and drives advertised features to completion.
pub struct NegotiationEngine {
    negotiators: HashMap<FeatureKind, Arc<dyn Negotiator>>,
    queue: VecDeque<StreamFeature>,
    pending: Option<StreamFeature>,
    advertised: Vec<FeatureKind>,
}

impl NegotiationEngine {
    /// Create an engine with no registered negotiators.
    pub fn new() -> Self {
        Self {
            negotiators: HashMap::new(),
            queue: VecDeque::new(),
            pending: None,
            advertised: Vec::new(),
        }
    }

    /// Register a negotiator for its feature kind.
    pub fn register(&mut self, negotiator: Arc<dyn Negotiator>) {
        self.negotiators.insert(negotiator.kind(), negotiator);
    }

    /// The feature currently being negotiated, if the engine is paused.
    pub fn pending_kind(&self) -> Option<FeatureKind> {
        self.pending.as_ref().map(|f| f.kind)
    }

    /// Whether the queue is drained and nothing is in flight.
    pub fn is_done(&self) -> bool {
        self.queue.is_empty() && self.pending.is_none()
    }

    /// Whether resource binding was advertised in the current stream.
    pub fn saw_bind(&self) -> bool {
        self.advertised.contains(&FeatureKind::Bind)
    }

    /// Clear all negotiation state. Called on every reconnect attempt and
    /// after each stream restart.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.pending = None;
        self.advertised.clear();
    }

    /// Consume a `<stream:features/>` advertisement: filter, order and
    /// begin negotiating.
    pub fn handle_features(&mut self, features: &Element) -> Result<EngineStep> {
        let mut advertised: Vec<StreamFeature> = features
            .children()
            .filter_map(StreamFeature::from_element)
            .collect();

        promote_sole_starttls(&mut advertised);
        sort_features(&mut advertised);

        debug!(
            features = ?advertised.iter().map(|f| f.kind).collect::<Vec<_>>(),
            "features advertised"
        );

        self.advertised = advertised.iter().map(|f| f.kind).collect();
        self.queue = advertised.into();
        self.pending = None;
        let mut step = EngineStep::default();
        self.negotiate_next(&mut step)?;
        Ok(step)
    }

    /// Route an inbound element to the negotiator that claims it.
    /// Returns `None` if no negotiator recognizes the element; the caller
    /// treats it as ordinary traffic.
    pub fn process_element(&mut self, element: &Element) -> Result<Option<EngineStep>> {
        let negotiator = self.claimant(element);
        let Some(negotiator) = negotiator else {
            return Ok(None);
        };

        let reply = negotiator.process(element)?;
        let mut step = EngineStep::default();
        step.sends.extend(reply.send);

        match reply.outcome {
            NegotiationOutcome::Incomplete => {
                trace!(kind = ?negotiator.kind(), "negotiation incomplete");
            }
            NegotiationOutcome::Success => {
                debug!(kind = ?negotiator.kind(), "feature negotiated");
                self.pending = None;
                if negotiator.needs_restart() {
                    // Restart clears the queue; a fresh advertisement
                    // follows the new stream header.
                    step.restart = true;
                    step.directive = negotiator.transport_directive();
                    self.queue.clear();
                } else {
                    self.negotiate_next(&mut step)?;
                }
            }
            NegotiationOutcome::Failure => {
                debug!(kind = ?negotiator.kind(), "feature declined, skipping");
                self.pending = None;
                self.negotiate_next(&mut step)?;
            }
        }
        Ok(Some(step))
    }

    /// Pop features off the queue until one pauses the engine or the
    /// queue drains. At most one feature is ever in flight.
    fn negotiate_next(&mut self, step: &mut EngineStep) -> Result<()> {
        while let Some(feature) = self.queue.pop_front() {
            let Some(negotiator) = self.negotiators.get(&feature.kind).cloned() else {
                trace!(kind = ?feature.kind, "no negotiator registered, skipping");
                continue;
            };

            let reply = negotiator.process(&feature.payload)?;
            step.sends.extend(reply.send);

            match reply.outcome {
                NegotiationOutcome::Incomplete => {
                    self.pending = Some(feature);
                    return Ok(());
                }
                NegotiationOutcome::Success => {
                    if negotiator.needs_restart() {
                        step.restart = true;
                        step.directive = negotiator.transport_directive();
                        self.queue.clear();
                        return Ok(());
                    }
                }
                NegotiationOutcome::Failure => {
                    debug!(kind = ?feature.kind, "feature declined, skipping");
                }
            }
        }
        Ok(())
    }

    fn claimant(&self, element: &Element) -> Option<Arc<dyn Negotiator>> {
        if let Some(pending) = &self.pending {
            if let Some(negotiator) = self.negotiators.get(&pending.kind) {
                if negotiator.can_claim(element) {
                    return Some(negotiator.clone());
                }
            }
        }
        self.negotiators
            .values()
            .find(|n| n.can_claim(element))
            .cloned()
    }
}

impl Default for NegotiationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable order: voluntary-to-negotiate features before mandatory ones,
/// advertisement order preserved within each group.
fn sort_features(features: &mut [StreamFeature]) {
    features.sort_by_key(|f| f.mandatory);
}

/// Protocol policy (kept file-local): an advertisement whose only feature
/// is "start encryption" means encryption is implicitly mandatory, even
/// if the server omitted `<required/>`.
fn promote_sole_starttls(features: &mut Vec<StreamFeature>) {
    if let [only] = features.as_mut_slice() {
        if only.kind == FeatureKind::StartTls {
            only.mandatory = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(kind: FeatureKind, mandatory: bool) -> StreamFeature {
        StreamFeature {
            kind,
            mandatory,
            payload: Element::new("feature"),
        }
    }

    #[test]
    fn test_sort_voluntary_before_mandatory_stable() {
        let mut features = vec![
            feature(FeatureKind::Compression, false),
            feature(FeatureKind::StartTls, true),
            feature(FeatureKind::Sasl, false),
            feature(FeatureKind::Bind, true),
            feature(FeatureKind::Session, true),
        ];
        sort_features(&mut features);

        let kinds: Vec<_> = features.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FeatureKind::Compression,
                FeatureKind::Sasl,
                FeatureKind::StartTls,
                FeatureKind::Bind,
                FeatureKind::Session,
            ]
        );
    }

    #[test]
    fn test_sole_starttls_promoted() {
        let mut features = vec![feature(FeatureKind::StartTls, false)];
        promote_sole_starttls(&mut features);
        assert!(features[0].mandatory);

        // Not promoted when other features are advertised.
        let mut features = vec![
            feature(FeatureKind::StartTls, false),
            feature(FeatureKind::Bind, true),
        ];
        promote_sole_starttls(&mut features);
        assert!(!features[0].mandatory);
    }

    #[test]
    fn test_classify_features() {
        let starttls = Element::new("starttls").attr("xmlns", NS_TLS);
        assert_eq!(
            FeatureKind::classify(&starttls),
            Some(FeatureKind::StartTls)
        );

        let unknown = Element::new("rosterver").attr("xmlns", "urn:xmpp:features:rosterver");
        assert_eq!(FeatureKind::classify(&unknown), None);
    }

    #[test]
    fn test_mandatory_detection() {
        let bind = Element::parse(
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><required/></bind>",
        )
        .unwrap();
        assert!(StreamFeature::from_element(&bind).unwrap().mandatory);

        let mechanisms = Element::parse(concat!(
            "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>",
            "<mechanism>PLAIN</mechanism></mechanisms>"
        ))
        .unwrap();
        assert!(StreamFeature::from_element(&mechanisms).unwrap().mandatory);

        let session = Element::parse(
            "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>",
        )
        .unwrap();
        assert!(!StreamFeature::from_element(&session).unwrap().mandatory);
    }

    #[test]
    fn test_engine_skips_unregistered_features() {
        let mut engine = NegotiationEngine::new();
        let features = Element::parse(concat!(
            "<stream:features>",
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><required/></bind>",
            "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>",
            "</stream:features>"
        ))
        .unwrap();

        let step = engine.handle_features(&features).unwrap();
        assert!(step.sends.is_empty());
        assert!(!step.restart);
        assert!(engine.is_done());
        assert!(engine.saw_bind());
    }

    #[test]
    fn test_unknown_element_unclaimed() {
        let mut engine = NegotiationEngine::new();
        engine.register(Arc::new(StartTlsNegotiator::new()));
        let el = Element::new("message");
        assert!(engine.process_element(&el).unwrap().is_none());
    }
}
