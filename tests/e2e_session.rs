//! End-to-end session lifecycle tests.
//!
//! These tests run the full client stack against a scripted XMPP server
//! on a local socket: connect, authenticate, bind, correlate queries and
//! handle stream-level failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use xylo::config::TransportCandidate;
use xylo::stanza::Iq;
use xylo::xml::Element;
use xylo::{Error, Session, SessionConfig, SessionStatus};

const SERVER_HEADER: &str = "<stream:stream from='example.org' id='s1' version='1.0' \
    xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";
const SASL_FEATURES: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>PLAIN</mechanism></mechanisms></stream:features>";
const BIND_FEATURES: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>";

/// Scripted peer: buffered reads so pipelined stanzas are not lost
/// between script steps.
struct Script {
    socket: TcpStream,
    buf: String,
}

impl Script {
    async fn accept(listener: TcpListener) -> Self {
        let (socket, _) = listener.accept().await.unwrap();
        Self {
            socket,
            buf: String::new(),
        }
    }

    /// Read until `pattern` appears, consuming through its end.
    async fn read_until(&mut self, pattern: &str) -> String {
        loop {
            if let Some(at) = self.buf.find(pattern) {
                let end = at + pattern.len();
                let consumed: String = self.buf.drain(..end).collect();
                return consumed;
            }
            let mut chunk = [0u8; 4096];
            let n = self.socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed while waiting for {pattern:?}");
            self.buf.push_str(std::str::from_utf8(&chunk[..n]).unwrap());
        }
    }

    async fn write(&mut self, text: &str) {
        self.socket.write_all(text.as_bytes()).await.unwrap();
        self.socket.flush().await.unwrap();
    }

    /// Walk the peer through header, SASL PLAIN and resource binding.
    async fn authenticate(&mut self, jid: &str) {
        self.read_until("<stream:stream").await;
        self.write(SERVER_HEADER).await;
        self.write(SASL_FEATURES).await;

        self.read_until("</auth>").await;
        self.write("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;

        // Fresh stream after authentication.
        self.read_until("<stream:stream").await;
        self.write(SERVER_HEADER).await;
        self.write(BIND_FEATURES).await;

        let bind = self.read_until("</iq>").await;
        let id = extract_id(&bind);
        self.write(&format!(
            "<iq type='result' id='{id}'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>{jid}</jid></bind></iq>"
        ))
        .await;
    }
}

fn extract_id(stanza: &str) -> String {
    let at = stanza.find("id=\"").expect("stanza carries an id") + 4;
    let rest = &stanza[at..];
    rest[..rest.find('"').unwrap()].to_string()
}

fn extract_attr(stanza: &str, attr: &str) -> String {
    let needle = format!("{attr}=\"");
    let at = stanza.find(&needle).expect("attribute present") + needle.len();
    let rest = &stanza[at..];
    rest[..rest.find('"').unwrap()].to_string()
}

async fn session_on_local_port() -> (Session, TcpListener) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = SessionConfig::for_domain("example.org");
    config.transports = vec![TransportCandidate::Tcp {
        host: "127.0.0.1".to_string(),
        port,
    }];
    config.connect_timeout_secs = 5;
    config.query_timeout_secs = 2;
    (Session::new(config), listener)
}

/// Test that connect() resolves at the pre-authentication pause and
/// login() completes authentication and binding.
#[tokio::test]
async fn test_connect_login_and_bind() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.authenticate("alice@example.org/engine").await;
    });

    session.connect().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Connected);
    // Not authenticated yet: connect stops before credentials.
    assert!(session.connected_address().is_none());

    let jid = session.login("alice", "secret").await.unwrap();
    assert_eq!(jid.to_string(), "alice@example.org/engine");
    assert_eq!(session.status(), SessionStatus::Authenticated);
    assert_eq!(session.connected_address(), Some(jid));

    server.await.unwrap();
    session.close().await.unwrap();
}

/// Test that a negotiation timeout surfaces directly instead of falling
/// through to the next transport candidate; candidate fallback is for
/// transport-level I/O failure only.
#[tokio::test]
async fn test_negotiation_timeout_skips_candidate_fallback() {
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_port = stalled.local_addr().unwrap().port();
    let fallback = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fallback_port = fallback.local_addr().unwrap().port();
    let fallback_contacted = Arc::new(AtomicBool::new(false));

    // First candidate answers the header but never advertises features.
    let server = tokio::spawn(async move {
        let mut script = Script::accept(stalled).await;
        script.read_until("<stream:stream").await;
        script.write(SERVER_HEADER).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    {
        let flag = fallback_contacted.clone();
        tokio::spawn(async move {
            if fallback.accept().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut config = SessionConfig::for_domain("example.org");
    config.transports = vec![
        TransportCandidate::Tcp {
            host: "127.0.0.1".to_string(),
            port: stalled_port,
        },
        TransportCandidate::Tcp {
            host: "127.0.0.1".to_string(),
            port: fallback_port,
        },
    ];
    config.connect_timeout_secs = 1;
    let session = Session::new(config);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::NoResponse));
    assert_eq!(session.status(), SessionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !fallback_contacted.load(Ordering::SeqCst),
        "timeout fell through to the next candidate"
    );
    server.abort();
}

/// Test that rejected credentials revert the session to connected and a
/// second attempt can succeed on the same stream.
#[tokio::test]
async fn test_login_failure_allows_retry() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.read_until("<stream:stream").await;
        script.write(SERVER_HEADER).await;
        script.write(SASL_FEATURES).await;

        script.read_until("</auth>").await;
        script
            .write(
                "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                 <not-authorized/></failure>",
            )
            .await;

        // Second attempt with good credentials.
        script.read_until("</auth>").await;
        script
            .write("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        script.read_until("<stream:stream").await;
        script.write(SERVER_HEADER).await;
        script.write(BIND_FEATURES).await;
        let bind = script.read_until("</iq>").await;
        let id = extract_id(&bind);
        script
            .write(&format!(
                "<iq type='result' id='{id}'>\
                 <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <jid>alice@example.org/retry</jid></bind></iq>"
            ))
            .await;
    });

    session.connect().await.unwrap();

    let err = session.login("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, Error::Login(_)));
    assert_eq!(session.status(), SessionStatus::Connected);

    let jid = session.login("alice", "secret").await.unwrap();
    assert_eq!(jid.resource_part(), Some("retry"));

    server.await.unwrap();
    session.close().await.unwrap();
}

/// Test that concurrent queries are matched by id even when responses
/// arrive out of order.
#[tokio::test]
async fn test_concurrent_queries_correlate_out_of_order() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.authenticate("alice@example.org/engine").await;

        // Collect three requests, answer them in reverse order, echoing
        // each request's marker back in the payload.
        let mut replies = Vec::new();
        for _ in 0..3 {
            let request = script.read_until("</iq>").await;
            let id = extract_id(&request);
            let marker = extract_attr(&request, "marker");
            replies.push(format!(
                "<iq type='result' id='{id}'>\
                 <echo xmlns='urn:test:echo' marker='{marker}'/></iq>"
            ));
        }
        for reply in replies.iter().rev() {
            script.write(reply).await;
        }
    });

    session.connect().await.unwrap();
    session.login("alice", "secret").await.unwrap();

    let mut handles = Vec::new();
    for marker in ["a", "b", "c"] {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            let payload = Element::new("echo")
                .attr("xmlns", "urn:test:echo")
                .attr("marker", marker);
            let response = session.query(Iq::get(payload)).await.unwrap();
            (marker, response)
        }));
    }

    for handle in handles {
        let (marker, response) = handle.await.unwrap();
        let echoed = response.payload.unwrap();
        assert_eq!(echoed.get_attr("marker"), Some(marker));
    }

    server.await.unwrap();
    session.close().await.unwrap();
}

/// Test that a query times out as NoResponse and a response arriving
/// after the timeout is dropped without disturbing later queries.
#[tokio::test]
async fn test_query_timeout_drops_late_response() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.authenticate("alice@example.org/engine").await;

        // First query: sit on it past the client timeout, then answer.
        let first = script.read_until("</iq>").await;
        let first_id = extract_id(&first);
        tokio::time::sleep(Duration::from_millis(600)).await;
        script
            .write(&format!("<iq type='result' id='{first_id}'/>"))
            .await;

        // Second query: answer promptly.
        let second = script.read_until("</iq>").await;
        let second_id = extract_id(&second);
        script
            .write(&format!(
                "<iq type='result' id='{second_id}'>\
                 <pong xmlns='urn:test:echo'/></iq>"
            ))
            .await;
    });

    session.connect().await.unwrap();
    session.login("alice", "secret").await.unwrap();

    let slow = Iq::get(Element::new("ping").attr("xmlns", "urn:test:echo"));
    let err = session
        .query_with_timeout(slow, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoResponse));

    let quick = Iq::get(Element::new("ping").attr("xmlns", "urn:test:echo"));
    let response = session.query(quick).await.unwrap();
    assert_eq!(response.payload.unwrap().local_name(), "pong");

    server.await.unwrap();
    session.close().await.unwrap();
}

/// Test that an error-kind response surfaces as a stanza error to the
/// one caller, not as a connection failure.
#[tokio::test]
async fn test_query_error_response() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.authenticate("alice@example.org/engine").await;

        let request = script.read_until("</iq>").await;
        let id = extract_id(&request);
        script
            .write(&format!(
                "<iq type='error' id='{id}'><error type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 </error></iq>"
            ))
            .await;
    });

    session.connect().await.unwrap();
    session.login("alice", "secret").await.unwrap();

    let query = Iq::get(Element::new("vCard").attr("xmlns", "vcard-temp"));
    let err = session.query(query).await.unwrap_err();
    match err {
        Error::Stanza(e) => assert_eq!(e.condition, "item-not-found"),
        other => panic!("expected stanza error, got {other}"),
    }
    // The session itself is untouched.
    assert_eq!(session.status(), SessionStatus::Authenticated);

    server.await.unwrap();
    session.close().await.unwrap();
}

/// Test that a conflict stream error disconnects without reconnecting.
#[tokio::test]
async fn test_conflict_disconnects_without_reconnect() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.authenticate("alice@example.org/engine").await;

        script
            .write(
                "<stream:error>\
                 <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                 </stream:error></stream:stream>",
            )
            .await;
    });

    session.connect().await.unwrap();
    let mut changes = session.status_changes();
    session.login("alice", "secret").await.unwrap();
    server.await.unwrap();

    loop {
        let change = changes.recv().await.unwrap();
        if change.to == SessionStatus::Disconnected {
            break;
        }
    }

    // A replaced session must stay down; reconnecting would steal the
    // stream back from the new connection.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.status(), SessionStatus::Disconnected);

    session.close().await.unwrap();
}

/// Test that inbound messages reach stanza subscribers.
#[tokio::test]
async fn test_inbound_messages_fan_out() {
    let (session, listener) = session_on_local_port().await;

    let server = tokio::spawn(async move {
        let mut script = Script::accept(listener).await;
        script.authenticate("alice@example.org/engine").await;
        script
            .write("<message from='bob@example.org'><body>hello</body></message>")
            .await;
        // Hold the socket open until the client closes.
        script.read_until("</stream:stream>").await;
    });

    session.connect().await.unwrap();
    let mut stanzas = session.stanzas();
    session.login("alice", "secret").await.unwrap();

    let stanza = stanzas.recv().await.unwrap();
    match stanza {
        xylo::Stanza::Message(el) => {
            assert_eq!(el.find_child("body").unwrap().content(), "hello");
        }
        other => panic!("expected message, got {other:?}"),
    }

    session.close().await.unwrap();
    server.await.unwrap();
}
