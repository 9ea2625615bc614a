//! Stanza data model.
//!
//! Deliberately minimal: extension payloads ride as untyped [`Element`]
//! trees. Only the pieces the engine itself needs are typed: the
//! info-query kinds for request/response correlation, the error payload
//! carried by error-kind responses, and addressing.

mod jid;

pub use jid::Jid;

use std::fmt;

use crate::xml::Element;

/// Namespace of defined stanza error conditions (RFC 6120 §8.3).
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// Namespace of the resource binding payload.
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Kind attribute of an info-query stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    /// Request for information.
    Get,
    /// Request to set or replace information.
    Set,
    /// Successful response.
    Result,
    /// Error response.
    Error,
}

impl IqKind {
    /// Whether this kind opens a request/response exchange.
    pub fn is_request(self) -> bool {
        matches!(self, IqKind::Get | IqKind::Set)
    }

    /// Wire value of the `type` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            IqKind::Get => "get",
            IqKind::Set => "set",
            IqKind::Result => "result",
            IqKind::Error => "error",
        }
    }

    fn from_attr(value: &str) -> Option<Self> {
        match value {
            "get" => Some(IqKind::Get),
            "set" => Some(IqKind::Set),
            "result" => Some(IqKind::Result),
            "error" => Some(IqKind::Error),
            _ => None,
        }
    }
}

/// An info-query stanza: the unit of synchronous request/response
/// correlation. The `id` is the correlation id echoed by the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    /// Correlation id.
    pub id: String,
    /// Request/response kind.
    pub kind: IqKind,
    /// Destination address.
    pub to: Option<Jid>,
    /// Origin address.
    pub from: Option<Jid>,
    /// Extension payload, if any.
    pub payload: Option<Element>,
    /// Error payload, present on error-kind responses.
    pub error: Option<StanzaError>,
}

impl Iq {
    /// Create a `get` request with a generated correlation id.
    pub fn get(payload: Element) -> Self {
        Self::request(IqKind::Get, payload)
    }

    /// Create a `set` request with a generated correlation id.
    pub fn set(payload: Element) -> Self {
        Self::request(IqKind::Set, payload)
    }

    fn request(kind: IqKind, payload: Element) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            to: None,
            from: None,
            payload: Some(payload),
            error: None,
        }
    }

    /// Builder: address the stanza.
    pub fn to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// Convert to its wire element.
    pub fn into_element(self) -> Element {
        let mut el = Element::new("iq")
            .attr("id", self.id)
            .attr("type", self.kind.as_str());
        if let Some(to) = self.to {
            el.set_attr("to", to.to_string());
        }
        if let Some(from) = self.from {
            el.set_attr("from", from.to_string());
        }
        if let Some(payload) = self.payload {
            el.push_child(payload);
        }
        if let Some(error) = self.error {
            el.push_child(error.into_element());
        }
        el
    }

    /// Decode from a wire element; `None` if it is not a well-formed iq.
    pub fn from_element(element: &Element) -> Option<Iq> {
        if element.local_name() != "iq" {
            return None;
        }
        let id = element.get_attr("id")?.to_string();
        let kind = IqKind::from_attr(element.get_attr("type")?)?;
        let error = element
            .find_child("error")
            .map(StanzaError::from_element);
        let payload = element
            .children()
            .find(|c| c.local_name() != "error")
            .cloned();
        Some(Iq {
            id,
            kind,
            to: element.get_attr("to").and_then(|s| s.parse().ok()),
            from: element.get_attr("from").and_then(|s| s.parse().ok()),
            payload,
            error,
        })
    }
}

/// The error payload of an error-kind response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// Defined condition, e.g. `item-not-found`.
    pub condition: String,
    /// Error behavior class (`cancel`, `modify`, `auth`, `wait`, `continue`).
    pub kind: String,
    /// Optional human-readable text.
    pub text: Option<String>,
}

impl StanzaError {
    /// Create an error with the given behavior class and condition.
    pub fn new(kind: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            kind: kind.into(),
            text: None,
        }
    }

    /// Decode from an `<error/>` element.
    pub fn from_element(element: &Element) -> StanzaError {
        let condition = element
            .children()
            .find(|c| c.namespace() == Some(NS_STANZAS) && c.local_name() != "text")
            .map(|c| c.local_name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = element
            .find_child_ns("text", NS_STANZAS)
            .map(|t| t.content());
        StanzaError {
            condition,
            kind: element.get_attr("type").unwrap_or("cancel").to_string(),
            text,
        }
    }

    /// Convert to its wire element.
    pub fn into_element(self) -> Element {
        let mut el = Element::new("error")
            .attr("type", self.kind)
            .child(Element::new(self.condition).attr("xmlns", NS_STANZAS));
        if let Some(text) = self.text {
            el.push_child(Element::new("text").attr("xmlns", NS_STANZAS).text(text));
        }
        el
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.kind)?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

/// A top-level addressed payload received after stream negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    /// Info-query (request/response).
    Iq(Iq),
    /// One-way message.
    Message(Element),
    /// Presence broadcast.
    Presence(Element),
}

impl Stanza {
    /// Classify a wire element; `None` for non-stanza elements
    /// (negotiation traffic, stream errors).
    pub fn from_element(element: &Element) -> Option<Stanza> {
        match element.local_name() {
            "iq" => Iq::from_element(element).map(Stanza::Iq),
            "message" => Some(Stanza::Message(element.clone())),
            "presence" => Some(Stanza::Presence(element.clone())),
            _ => None,
        }
    }
}

/// Build the resource binding request payload.
pub fn bind_request(resource_hint: Option<&str>) -> Element {
    let mut bind = Element::new("bind").attr("xmlns", NS_BIND);
    if let Some(resource) = resource_hint {
        bind.push_child(Element::new("resource").text(resource));
    }
    bind
}

/// Extract the bound address from a binding result payload.
pub fn bound_jid(payload: &Element) -> Option<Jid> {
    payload
        .find_child("jid")
        .and_then(|jid| jid.content().parse().ok())
}
