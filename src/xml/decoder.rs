//! Incremental, restartable stream decoding.
//!
//! The decoder accumulates inbound bytes and emits events only at element
//! boundaries: the stream header when its opening tag is complete, each
//! top-level element once its closing tag has arrived, and the stream
//! closing marker. Partial input stays buffered until the next feed.
//!
//! After a negotiated stream restart (TLS, SASL, compression) the server
//! starts a brand-new XML document, so [`StreamDecoder::restart`] drops
//! every accumulated byte and forgets the header.

use bytes::{Buf, BytesMut};
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{element_from_tag, Element};
use crate::error::{Error, Result};

/// An event produced by the [`StreamDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream header opening tag, carrying its attributes. The header
    /// element stays open for the lifetime of the stream.
    Header(Element),
    /// A complete top-level element, with the raw text it was decoded from.
    Element {
        /// Raw XML text of the element as received.
        raw: String,
        /// Decoded element tree.
        element: Element,
    },
    /// The stream closing marker (`</stream:stream>`).
    StreamClosed,
}

/// Cap on buffered bytes awaiting an element boundary. A peer that never
/// completes an element fails the stream instead of growing the buffer.
const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

/// Incremental decoder for an XML element stream.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: BytesMut,
    saw_header: bool,
    max_pending: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    /// Create a decoder with a custom pending-byte cap.
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            saw_header: false,
            max_pending,
        }
    }

    /// Forget all accumulated state. Safe to call repeatedly: a double
    /// restart is equivalent to a single one.
    pub fn restart(&mut self) {
        self.buf.clear();
        self.saw_header = false;
    }

    /// Number of bytes buffered awaiting an element boundary.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Feed inbound bytes, returning every event that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>> {
        self.buf.extend_from_slice(bytes);

        // Only parse the valid UTF-8 prefix; a multi-byte character split
        // across feeds stays buffered until its tail arrives.
        let text = match std::str::from_utf8(&self.buf) {
            Ok(t) => t,
            Err(e) if e.error_len().is_none() => {
                std::str::from_utf8(&self.buf[..e.valid_up_to()]).expect("validated prefix")
            }
            Err(_) => return Err(Error::Xml("stream is not valid UTF-8".to_string())),
        };

        let mut reader = Reader::from_str(text);
        // Unmatched end tags are expected: the header's closing tag pairs
        // with a start tag consumed in an earlier feed.
        reader.config_mut().check_end_names = false;
        reader.config_mut().allow_unmatched_ends = true;

        let mut events = Vec::new();
        let mut consumed = 0usize;
        let mut depth = 0usize;
        let mut stanza_start = 0usize;

        loop {
            let pos_before = reader.buffer_position() as usize;
            match reader.read_event() {
                Ok(Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)) => {
                    if depth == 0 {
                        consumed = reader.buffer_position() as usize;
                    }
                }
                Ok(Event::Text(_) | Event::CData(_)) => {
                    // Top-level text is whitespace keepalive; inside a
                    // pending element it is re-parsed at the boundary.
                    if depth == 0 {
                        consumed = reader.buffer_position() as usize;
                    }
                }
                Ok(Event::Start(tag)) => {
                    if depth == 0 && !self.saw_header && is_stream_header(tag.name().as_ref()) {
                        let header = element_from_tag(&reader, &tag)?;
                        self.saw_header = true;
                        consumed = reader.buffer_position() as usize;
                        events.push(StreamEvent::Header(header));
                    } else {
                        if depth == 0 {
                            stanza_start = pos_before;
                        }
                        depth += 1;
                    }
                }
                Ok(Event::Empty(_)) => {
                    if depth == 0 {
                        let raw = text[pos_before..reader.buffer_position() as usize].to_string();
                        let element = Element::parse(&raw)?;
                        consumed = reader.buffer_position() as usize;
                        events.push(StreamEvent::Element { raw, element });
                    }
                }
                Ok(Event::End(tag)) => {
                    if depth == 0 {
                        if self.saw_header && is_stream_header(tag.name().as_ref()) {
                            consumed = reader.buffer_position() as usize;
                            events.push(StreamEvent::StreamClosed);
                        } else {
                            return Err(Error::Xml(format!(
                                "unexpected closing tag </{}>",
                                String::from_utf8_lossy(tag.name().as_ref())
                            )));
                        }
                    } else {
                        depth -= 1;
                        if depth == 0 {
                            let raw = text[stanza_start..reader.buffer_position() as usize].to_string();
                            let element = Element::parse(&raw)?;
                            consumed = reader.buffer_position() as usize;
                            events.push(StreamEvent::Element { raw, element });
                        }
                    }
                }
                Ok(Event::Eof) => break,
                // Syntax errors surface at end of input: the buffer ends
                // mid-tag and the remainder has not arrived yet.
                Err(quick_xml::Error::Syntax(_)) => break,
                Err(e) => return Err(Error::Xml(e.to_string())),
            }
        }

        self.buf.advance(consumed);
        if self.buf.len() > self.max_pending {
            return Err(Error::Xml(format!(
                "{} bytes buffered without reaching an element boundary",
                self.buf.len()
            )));
        }
        Ok(events)
    }
}

/// The header element is `<stream:stream>` (or unprefixed `<stream>`).
fn is_stream_header(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes() -> &'static [u8] {
        b"<?xml version='1.0'?><stream:stream from='example.org' id='s1' \
          xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>"
    }

    #[test]
    fn test_header_then_element() {
        let mut dec = StreamDecoder::new();
        let mut events = dec.feed(header_bytes()).unwrap();
        events.extend(dec.feed(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>").unwrap());

        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Header(h) => {
                assert_eq!(h.get_attr("from"), Some("example.org"));
                assert_eq!(h.get_attr("id"), Some("s1"));
            }
            other => panic!("expected header, got {other:?}"),
        }
        match &events[1] {
            StreamEvent::Element { element, .. } => {
                assert_eq!(element.local_name(), "features");
                assert!(element.find_child("bind").is_some());
            }
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_element_buffers() {
        let mut dec = StreamDecoder::new();
        dec.feed(header_bytes()).unwrap();

        let events = dec.feed(b"<message to='a@example.org'><body>hel").unwrap();
        assert!(events.is_empty());
        assert!(dec.pending_bytes() > 0);

        let events = dec.feed(b"lo</body></message>").unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Element { element, .. } => {
                assert_eq!(element.find_child("body").unwrap().content(), "hello");
            }
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn test_split_mid_tag() {
        let mut dec = StreamDecoder::new();
        dec.feed(header_bytes()).unwrap();

        assert!(dec.feed(b"<presen").unwrap().is_empty());
        let events = dec.feed(b"ce/>").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_stream_close_marker() {
        let mut dec = StreamDecoder::new();
        dec.feed(header_bytes()).unwrap();
        let events = dec.feed(b"</stream:stream>").unwrap();
        assert_eq!(events, vec![StreamEvent::StreamClosed]);
    }

    #[test]
    fn test_restart_is_idempotent() {
        let mut dec = StreamDecoder::new();
        dec.feed(header_bytes()).unwrap();
        dec.feed(b"<message><body>partial").unwrap();

        dec.restart();
        dec.restart();
        assert_eq!(dec.pending_bytes(), 0);

        // A fresh document decodes exactly once, no leftovers.
        let events = dec.feed(header_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Header(_)));
    }

    #[test]
    fn test_pending_bytes_are_capped() {
        let mut dec = StreamDecoder::with_max_pending(64);
        dec.feed(header_bytes()).unwrap();

        // A small partial element stays buffered.
        assert!(dec.feed(b"<message><body>").unwrap().is_empty());

        // An endless body with no element boundary fails instead of
        // accumulating without bound.
        let err = dec.feed(&[b'a'; 100]).unwrap_err();
        assert!(matches!(err, Error::Xml(_)));
    }

    #[test]
    fn test_multiple_elements_in_one_feed() {
        let mut dec = StreamDecoder::new();
        dec.feed(header_bytes()).unwrap();
        let events = dec
            .feed(b"<presence/><message><body>hi</body></message><iq type='result' id='1'/>")
            .unwrap();
        assert_eq!(events.len(), 3);
    }
}
