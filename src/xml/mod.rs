//! XML element model and stream decoding.
//!
//! This module is the crate's marshal/unmarshal boundary. Everything above
//! it (session, negotiation, transports) works in terms of [`Element`]
//! trees; everything below it is `quick-xml` event plumbing.
//!
//! The [`StreamDecoder`] turns an inbound byte stream into a stream header
//! followed by complete top-level elements, buffering partial input and
//! forgetting all state on a negotiated restart.

mod decoder;

pub use decoder::{StreamDecoder, StreamEvent};

use std::fmt;
use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// A child node of an [`Element`]: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Nested element.
    Element(Element),
    /// Character data (already unescaped).
    Text(String),
}

/// A decoded XML element: qualified name, attributes and children.
///
/// Names are kept exactly as they appeared on the wire (prefix included);
/// [`Element::local_name`] strips the prefix when matching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an element with the given qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: add or replace an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder: append a child element.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder: append character data.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Add or replace an attribute in place.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.attrs.push((key, value));
        }
    }

    /// Append a child element in place.
    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Qualified name as it appeared on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name with any namespace prefix stripped.
    pub fn local_name(&self) -> &str {
        self.name
            .rsplit_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    /// Attribute lookup.
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `xmlns` attribute, if present.
    pub fn namespace(&self) -> Option<&str> {
        self.get_attr("xmlns")
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name.
    pub fn find_child(&self, local_name: &str) -> Option<&Element> {
        self.children().find(|e| e.local_name() == local_name)
    }

    /// First child element with the given local name and `xmlns`.
    pub fn find_child_ns(&self, local_name: &str, ns: &str) -> Option<&Element> {
        self.children()
            .find(|e| e.local_name() == local_name && e.namespace() == Some(ns))
    }

    /// Concatenated direct character data.
    pub fn content(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Whether the element has neither children nor character data.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Serialize to XML text.
    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        // Writing into an in-memory cursor cannot fail.
        let _ = self.write_into(&mut writer);
        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }

    fn write_into(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
        writer.write_event(Event::Start(start))?;
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_into(writer)?,
                Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }

    /// Parse a complete, standalone element from XML text.
    pub fn parse(text: &str) -> Result<Element> {
        let mut reader = Reader::from_str(text);
        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    stack.push(element_from_tag(&reader, &e)?);
                }
                Ok(Event::Empty(e)) => {
                    let element = element_from_tag(&reader, &e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_child(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_child(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Xml(e.to_string()))?
                        .into_owned();
                    if let Some(parent) = stack.last_mut() {
                        if !text.is_empty() {
                            parent.children.push(Node::Text(text));
                        }
                    }
                }
                Ok(Event::CData(t)) => {
                    let text = String::from_utf8_lossy(&t).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text));
                    }
                }
                Ok(Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)) => {}
                Ok(Event::Eof) => {
                    return Err(Error::Xml("truncated element".to_string()));
                }
                Err(e) => return Err(Error::Xml(e.to_string())),
            }
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Build an [`Element`] from a start/empty tag, decoding attributes.
pub(super) fn element_from_tag(reader: &Reader<&[u8]>, tag: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
    let mut element = Element::new(name);
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| Error::Xml(e.to_string()))?
            .into_owned();
        element.set_attr(key, value);
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_builder_roundtrip() {
        let iq = Element::new("iq")
            .attr("type", "get")
            .attr("id", "q1")
            .child(Element::new("query").attr("xmlns", "jabber:iq:roster"));

        let xml = iq.to_xml();
        assert_eq!(
            xml,
            r#"<iq type="get" id="q1"><query xmlns="jabber:iq:roster"/></iq>"#
        );

        let parsed = Element::parse(&xml).unwrap();
        assert_eq!(parsed, iq);
    }

    #[test]
    fn test_text_escaping() {
        let msg = Element::new("message").child(Element::new("body").text("a < b & c"));
        let xml = msg.to_xml();
        assert!(xml.contains("a &lt; b &amp; c"));

        let parsed = Element::parse(&xml).unwrap();
        assert_eq!(parsed.find_child("body").unwrap().content(), "a < b & c");
    }

    #[test]
    fn test_local_name_strips_prefix() {
        let features = Element::parse("<stream:features/>").unwrap();
        assert_eq!(features.name(), "stream:features");
        assert_eq!(features.local_name(), "features");
    }

    #[test]
    fn test_find_child_ns() {
        let features = Element::parse(concat!(
            "<stream:features>",
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>",
            "</stream:features>"
        ))
        .unwrap();

        assert!(features
            .find_child_ns("starttls", "urn:ietf:params:xml:ns:xmpp-tls")
            .is_some());
        assert!(features
            .find_child_ns("starttls", "urn:ietf:params:xml:ns:xmpp-bind")
            .is_none());
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut el = Element::new("body");
        el.set_attr("rid", "1");
        el.set_attr("rid", "2");
        assert_eq!(el.get_attr("rid"), Some("2"));
        assert_eq!(el.attrs().count(), 1);
    }

    #[test]
    fn test_parse_truncated_fails() {
        assert!(Element::parse("<iq type='get'><query").is_err());
    }
}
