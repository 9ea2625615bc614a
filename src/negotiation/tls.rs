//! STARTTLS negotiation.
//!
//! Three-element exchange: the advertisement prompts a `<starttls/>`
//! command, the server answers `<proceed/>` or `<failure/>`. On proceed
//! the session secures the transport and restarts the stream.

use super::{
    FeatureKind, NegotiationOutcome, NegotiationReply, Negotiator, TransportDirective, NS_TLS,
};
use crate::error::Result;
use crate::xml::Element;

/// Negotiator for stream encryption.
#[derive(Debug, Default)]
pub struct StartTlsNegotiator;

impl StartTlsNegotiator {
    /// Create the negotiator.
    pub fn new() -> Self {
        Self
    }
}

impl Negotiator for StartTlsNegotiator {
    fn kind(&self) -> FeatureKind {
        FeatureKind::StartTls
    }

    fn process(&self, element: &Element) -> Result<NegotiationReply> {
        match element.local_name() {
            "starttls" => Ok(NegotiationReply::sending(
                NegotiationOutcome::Incomplete,
                Element::new("starttls").attr("xmlns", NS_TLS),
            )),
            "proceed" => Ok(NegotiationReply::of(NegotiationOutcome::Success)),
            "failure" => Ok(NegotiationReply::of(NegotiationOutcome::Failure)),
            _ => Ok(NegotiationReply::of(NegotiationOutcome::Incomplete)),
        }
    }

    fn needs_restart(&self) -> bool {
        true
    }

    fn can_claim(&self, element: &Element) -> bool {
        element.namespace() == Some(NS_TLS)
    }

    fn transport_directive(&self) -> Option<TransportDirective> {
        Some(TransportDirective::Secure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_sends_command() {
        let neg = StartTlsNegotiator::new();
        let feature = Element::new("starttls").attr("xmlns", NS_TLS);
        let reply = neg.process(&feature).unwrap();
        assert_eq!(reply.outcome, NegotiationOutcome::Incomplete);
        assert_eq!(reply.send.unwrap().local_name(), "starttls");
    }

    #[test]
    fn test_proceed_succeeds_with_secure_directive() {
        let neg = StartTlsNegotiator::new();
        let proceed = Element::new("proceed").attr("xmlns", NS_TLS);
        assert!(neg.can_claim(&proceed));

        let reply = neg.process(&proceed).unwrap();
        assert_eq!(reply.outcome, NegotiationOutcome::Success);
        assert!(neg.needs_restart());
        assert_eq!(neg.transport_directive(), Some(TransportDirective::Secure));
    }

    #[test]
    fn test_failure_is_failure() {
        let neg = StartTlsNegotiator::new();
        let failure = Element::new("failure").attr("xmlns", NS_TLS);
        let reply = neg.process(&failure).unwrap();
        assert_eq!(reply.outcome, NegotiationOutcome::Failure);
    }

    #[test]
    fn test_does_not_claim_foreign_elements() {
        let neg = StartTlsNegotiator::new();
        let el = Element::new("proceed").attr("xmlns", "urn:other");
        assert!(!neg.can_claim(&el));
    }
}
