//! Stream compression negotiation.
//!
//! Picks the first advertised method the client also supports, sends the
//! `<compress/>` command and, on `<compressed/>`, directs the session to
//! enable the codec on the transport before restarting the stream.

use std::sync::Mutex;

use tracing::debug;

use super::{
    FeatureKind, NegotiationOutcome, NegotiationReply, Negotiator, TransportDirective,
    NS_COMPRESS, NS_COMPRESS_FEATURE,
};
use crate::error::Result;
use crate::transport::CompressionMethod;
use crate::xml::Element;

/// Negotiator for stream compression (zlib).
#[derive(Debug, Default)]
pub struct CompressionNegotiator {
    chosen: Mutex<Option<CompressionMethod>>,
}

impl CompressionNegotiator {
    /// Create the negotiator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Negotiator for CompressionNegotiator {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Compression
    }

    fn process(&self, element: &Element) -> Result<NegotiationReply> {
        match (element.local_name(), element.namespace()) {
            ("compression", Some(NS_COMPRESS_FEATURE)) => {
                let method = element
                    .children()
                    .filter(|c| c.local_name() == "method")
                    .find_map(|c| CompressionMethod::from_name(&c.content()));

                let Some(method) = method else {
                    debug!("no mutually supported compression method");
                    return Ok(NegotiationReply::of(NegotiationOutcome::Failure));
                };

                *self.chosen.lock().expect("compression state") = Some(method);
                Ok(NegotiationReply::sending(
                    NegotiationOutcome::Incomplete,
                    Element::new("compress")
                        .attr("xmlns", NS_COMPRESS)
                        .child(Element::new("method").text(method.name())),
                ))
            }
            ("compressed", _) => Ok(NegotiationReply::of(NegotiationOutcome::Success)),
            ("failure", _) => Ok(NegotiationReply::of(NegotiationOutcome::Failure)),
            _ => Ok(NegotiationReply::of(NegotiationOutcome::Incomplete)),
        }
    }

    fn needs_restart(&self) -> bool {
        true
    }

    fn can_claim(&self, element: &Element) -> bool {
        element.namespace() == Some(NS_COMPRESS)
    }

    fn transport_directive(&self) -> Option<TransportDirective> {
        self.chosen
            .lock()
            .expect("compression state")
            .map(TransportDirective::Compress)
    }
}
