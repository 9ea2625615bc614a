//! SASL authentication negotiation.
//!
//! During `connect()` the negotiator only records the advertised
//! mechanisms and pauses the engine; that pause is the "just before
//! authentication" point the session's `connect()` resolves on. Later,
//! `login()` supplies credentials, sends the initial `<auth/>` and awaits
//! the outcome through [`SaslNegotiator::await_result`].
//!
//! Only PLAIN is implemented here; the mechanism catalog is a pluggable
//! concern outside this crate.

use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Notify;
use tracing::debug;

use super::{FeatureKind, NegotiationOutcome, NegotiationReply, Negotiator, NS_SASL};
use crate::error::{Error, Result};
use crate::xml::Element;

#[derive(Debug, Default)]
struct SaslState {
    mechanisms: Vec<String>,
    result: Option<std::result::Result<(), String>>,
}

/// Negotiator for SASL authentication (PLAIN).
#[derive(Debug, Default)]
pub struct SaslNegotiator {
    state: Mutex<SaslState>,
    done: Notify,
}

impl SaslNegotiator {
    /// Create the negotiator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mechanisms advertised by the server in the current stream.
    pub fn mechanisms(&self) -> Vec<String> {
        self.state.lock().expect("sasl state").mechanisms.clone()
    }

    /// Build the initial `<auth/>` element for PLAIN credentials.
    ///
    /// Fails if the server did not advertise PLAIN.
    pub fn initiate_plain(&self, authzid: &str, password: &str) -> Result<Element> {
        let mut state = self.state.lock().expect("sasl state");
        if !state.mechanisms.iter().any(|m| m == "PLAIN") {
            return Err(Error::Login(format!(
                "server offers no supported mechanism (advertised: {:?})",
                state.mechanisms
            )));
        }
        // A new exchange invalidates the outcome of any earlier attempt.
        state.result = None;
        drop(state);

        let mut message = Vec::with_capacity(authzid.len() + password.len() + 2);
        message.push(0);
        message.extend_from_slice(authzid.as_bytes());
        message.push(0);
        message.extend_from_slice(password.as_bytes());

        Ok(Element::new("auth")
            .attr("xmlns", NS_SASL)
            .attr("mechanism", "PLAIN")
            .text(BASE64.encode(message)))
    }

    /// Wait until the server answers `<success/>` or `<failure/>`.
    pub async fn await_result(&self) -> Result<()> {
        loop {
            let notified = self.done.notified();
            if let Some(result) = self.state.lock().expect("sasl state").result.clone() {
                return result.map_err(Error::Login);
            }
            notified.await;
        }
    }

    fn finish(&self, result: std::result::Result<(), String>) {
        self.state.lock().expect("sasl state").result = Some(result);
        self.done.notify_waiters();
    }
}

impl Negotiator for SaslNegotiator {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Sasl
    }

    fn process(&self, element: &Element) -> Result<NegotiationReply> {
        match element.local_name() {
            "mechanisms" => {
                // A fresh advertisement resets any previous exchange.
                let mechanisms: Vec<String> = element
                    .children()
                    .filter(|c| c.local_name() == "mechanism")
                    .map(|c| c.content())
                    .collect();
                debug!(?mechanisms, "authentication mechanisms advertised");
                let mut state = self.state.lock().expect("sasl state");
                state.mechanisms = mechanisms;
                state.result = None;
                Ok(NegotiationReply::of(NegotiationOutcome::Incomplete))
            }
            // PLAIN never issues a challenge; answer an unexpected one
            // with an empty response rather than stalling the stream.
            "challenge" => Ok(NegotiationReply::sending(
                NegotiationOutcome::Incomplete,
                Element::new("response").attr("xmlns", NS_SASL),
            )),
            "success" => {
                self.finish(Ok(()));
                Ok(NegotiationReply::of(NegotiationOutcome::Success))
            }
            "failure" => {
                let condition = element
                    .children()
                    .next()
                    .map(|c| c.local_name().to_string())
                    .unwrap_or_else(|| "not-authorized".to_string());
                self.finish(Err(condition));
                Ok(NegotiationReply::of(NegotiationOutcome::Failure))
            }
            _ => Ok(NegotiationReply::of(NegotiationOutcome::Incomplete)),
        }
    }

    fn needs_restart(&self) -> bool {
        true
    }

    fn can_claim(&self, element: &Element) -> bool {
        element.namespace() == Some(NS_SASL)
    }
}
