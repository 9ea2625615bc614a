//! Persistent-stream TCP transport.
//!
//! A read loop feeds inbound bytes through optional zlib decompression
//! into the incremental [`StreamDecoder`]; outbound elements are written
//! through optional zlib compression. TLS upgrade is performed by an
//! injected [`TlsUpgrader`]; the cryptographic mechanism itself lives
//! outside this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, trace, warn};

use super::{not_open, CompressionMethod, EventSender, Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::xml::{Element, StreamDecoder, StreamEvent};

/// Object-safe byte stream: TCP, or whatever a [`TlsUpgrader`] returns.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Pluggable TLS upgrade hook.
///
/// Without one, `secure()` fails: shipping TLS mechanics is out of scope
/// for the engine, the application injects its preferred implementation.
pub trait TlsUpgrader: Send + Sync {
    /// Wrap the plaintext stream in TLS for the given server name.
    fn upgrade(
        &self,
        stream: Box<dyn AsyncStream>,
        domain: &str,
    ) -> BoxFuture<'static, Result<Box<dyn AsyncStream>>>;
}

struct ReaderHandle {
    stop: oneshot::Sender<()>,
    returned: oneshot::Receiver<ReadHalf<Box<dyn AsyncStream>>>,
}

struct Conn {
    write: WriteHalf<Box<dyn AsyncStream>>,
    deflate: Option<Compress>,
    reader: ReaderHandle,
}

struct Shared {
    decoder: StdMutex<StreamDecoder>,
    inflate: StdMutex<Option<Decompress>>,
    events: StdMutex<Option<EventSender>>,
    closed: Notify,
    is_closed: AtomicBool,
}

impl Shared {
    /// Decompress (if negotiated), decode and forward inbound bytes.
    fn ingest(&self, bytes: &[u8]) -> Result<()> {
        let plain;
        {
            let mut inflate = self.inflate.lock().expect("inflate state");
            plain = match inflate.as_mut() {
                Some(state) => inflate_chunk(state, bytes)?,
                None => bytes.to_vec(),
            };
        }

        let events = {
            let mut decoder = self.decoder.lock().expect("decoder state");
            decoder.feed(&plain)?
        };
        for event in events {
            self.emit(match event {
                StreamEvent::Header(h) => TransportEvent::Header(h),
                StreamEvent::Element { raw, element } => TransportEvent::Element { raw, element },
                StreamEvent::StreamClosed => TransportEvent::StreamClosed,
            });
        }
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sender) = self.events.lock().expect("event sender").as_ref() {
            let _ = sender.send(event);
        }
    }

    fn fail(&self, error: Error) {
        warn!(%error, "tcp transport failed");
        self.emit(TransportEvent::Failed(error));
        self.mark_closed();
    }

    fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }
}

/// Persistent stream transport over TCP.
pub struct TcpTransport {
    host: String,
    port: u16,
    domain: String,
    upgrader: Option<Arc<dyn TlsUpgrader>>,
    conn: Mutex<Option<Conn>>,
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Create a transport targeting `host:port` for the given stream domain.
    pub fn new(host: impl Into<String>, port: u16, domain: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            domain: domain.into(),
            upgrader: None,
            conn: Mutex::new(None),
            shared: Arc::new(Shared {
                decoder: StdMutex::new(StreamDecoder::new()),
                inflate: StdMutex::new(None),
                events: StdMutex::new(None),
                closed: Notify::new(),
                is_closed: AtomicBool::new(false),
            }),
        }
    }

    /// Inject the TLS upgrade implementation used by `secure()`.
    pub fn with_tls_upgrader(mut self, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    fn stream_header(&self) -> String {
        format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xml:lang='en' \
             xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            self.domain
        )
    }

    fn spawn_reader(&self, read: ReadHalf<Box<dyn AsyncStream>>) -> ReaderHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ret_tx, ret_rx) = oneshot::channel();
        tokio::spawn(read_loop(read, stop_rx, ret_tx, self.shared.clone()));
        ReaderHandle {
            stop: stop_tx,
            returned: ret_rx,
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(not_open)?;
        let payload = match conn.deflate.as_mut() {
            Some(state) => deflate_chunk(state, bytes)?,
            None => bytes.to_vec(),
        };
        conn.write.write_all(&payload).await?;
        conn.write.flush().await?;
        Ok(())
    }
}

async fn read_loop(
    mut read: ReadHalf<Box<dyn AsyncStream>>,
    mut stop: oneshot::Receiver<()>,
    returned: oneshot::Sender<ReadHalf<Box<dyn AsyncStream>>>,
    shared: Arc<Shared>,
) {
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            _ = &mut stop => {
                // Hand the read half back for TLS upgrade or shutdown.
                let _ = returned.send(read);
                return;
            }
            result = read.read(&mut buf) => match result {
                Ok(0) => {
                    shared.fail(Error::Transport("connection closed by peer".to_string()));
                    return;
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    if let Err(e) = shared.ingest(&buf[..n]) {
                        shared.fail(e);
                        return;
                    }
                }
                Err(e) => {
                    shared.fail(e.into());
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn open(&self, events: EventSender) -> Result<()> {
        *self.shared.events.lock().expect("event sender") = Some(events);
        self.shared.is_closed.store(false, Ordering::SeqCst);

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::Transport(format!("connect {}:{}: {e}", self.host, self.port)))?;
        debug!(host = %self.host, port = self.port, "tcp connected");

        let boxed: Box<dyn AsyncStream> = Box::new(stream);
        let (read, write) = tokio::io::split(boxed);
        let reader = self.spawn_reader(read);
        *self.conn.lock().await = Some(Conn {
            write,
            deflate: None,
            reader,
        });

        self.write_raw(self.stream_header().as_bytes()).await
    }

    async fn send(&self, element: Element) -> Result<()> {
        self.write_raw(element.to_xml().as_bytes()).await
    }

    async fn secure(&self) -> Result<()> {
        let upgrader = self
            .upgrader
            .clone()
            .ok_or_else(|| Error::Transport("no TLS upgrader configured".to_string()))?;

        let mut guard = self.conn.lock().await;
        let conn = guard.take().ok_or_else(not_open)?;

        // Quiesce the reader and reunite the halves before the handshake.
        let _ = conn.reader.stop.send(());
        let read = conn
            .reader
            .returned
            .await
            .map_err(|_| Error::Transport("reader exited before TLS upgrade".to_string()))?;
        let plain = read.unsplit(conn.write);

        let secured = upgrader.upgrade(plain, &self.domain).await?;
        debug!("tls established");

        let (read, write) = tokio::io::split(secured);
        let reader = self.spawn_reader(read);
        *guard = Some(Conn {
            write,
            deflate: None,
            reader,
        });
        Ok(())
    }

    async fn compress(&self, method: CompressionMethod) -> Result<()> {
        match method {
            CompressionMethod::Zlib => {
                let mut guard = self.conn.lock().await;
                let conn = guard.as_mut().ok_or_else(not_open)?;
                conn.deflate = Some(Compress::new(Compression::default(), true));
                *self.shared.inflate.lock().expect("inflate state") =
                    Some(Decompress::new(true));
                debug!("zlib stream compression enabled");
                Ok(())
            }
        }
    }

    async fn restart_stream(&self) -> Result<()> {
        self.shared.decoder.lock().expect("decoder state").restart();
        self.write_raw(self.stream_header().as_bytes()).await
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            let closer = "</stream:stream>";
            let payload = match conn.deflate.as_mut() {
                Some(state) => deflate_chunk(state, closer.as_bytes())?,
                None => closer.as_bytes().to_vec(),
            };
            let _ = conn.write.write_all(&payload).await;
            let _ = conn.write.shutdown().await;
            let _ = conn.reader.stop.send(());
        }
        self.shared.mark_closed();
        Ok(())
    }

    async fn wait_closed(&self) {
        while !self.shared.is_closed.load(Ordering::SeqCst) {
            self.shared.closed.notified().await;
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Compress one chunk with a sync flush so the peer can decode it
/// immediately.
fn deflate_chunk(state: &mut Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut pos = 0usize;
    loop {
        let before_in = state.total_in() as usize;
        let before_out = state.total_out() as usize;
        let mut chunk = [0u8; 8192];
        let status = state
            .compress(&input[pos..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| Error::Transport(format!("deflate: {e}")))?;
        if matches!(status, Status::BufError) {
            return Err(Error::Transport("deflate: no progress".to_string()));
        }
        let consumed = state.total_in() as usize - before_in;
        let produced = state.total_out() as usize - before_out;
        pos += consumed;
        out.extend_from_slice(&chunk[..produced]);
        if matches!(status, Status::StreamEnd) || (pos >= input.len() && produced < chunk.len()) {
            break;
        }
    }
    Ok(out)
}

/// Decompress one inbound chunk; the zlib stream spans the whole
/// connection, so no flush finalization happens here.
fn inflate_chunk(state: &mut Decompress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 2 + 64);
    let mut pos = 0usize;
    loop {
        let before_in = state.total_in() as usize;
        let before_out = state.total_out() as usize;
        let mut chunk = [0u8; 8192];
        let status = state
            .decompress(&input[pos..], &mut chunk, FlushDecompress::Sync)
            .map_err(|e| Error::Transport(format!("inflate: {e}")))?;
        if matches!(status, Status::BufError) {
            return Err(Error::Transport("inflate: no progress".to_string()));
        }
        let consumed = state.total_in() as usize - before_in;
        let produced = state.total_out() as usize - before_out;
        pos += consumed;
        out.extend_from_slice(&chunk[..produced]);
        if matches!(status, Status::StreamEnd) || (pos >= input.len() && produced < chunk.len()) {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_deflate_inflate_roundtrip() {
        let mut c = Compress::new(Compression::default(), true);
        let mut d = Decompress::new(true);

        let first = deflate_chunk(&mut c, b"<presence/>").unwrap();
        let second = deflate_chunk(&mut c, b"<message><body>hi</body></message>").unwrap();

        let mut plain = inflate_chunk(&mut d, &first).unwrap();
        plain.extend(inflate_chunk(&mut d, &second).unwrap());
        assert_eq!(
            plain,
            b"<presence/><message><body>hi</body></message>".to_vec()
        );
    }

    #[tokio::test]
    async fn test_open_receives_header_and_elements() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Swallow the client header, then answer with our own.
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(
                    b"<stream:stream from='example.org' id='t1' version='1.0' \
                      xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>\
                      <stream:features/>",
                )
                .await
                .unwrap();
        });

        let transport = TcpTransport::new("127.0.0.1", port, "example.org");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Header(h) => assert_eq!(h.get_attr("id"), Some("t1")),
            other => panic!("expected header, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TransportEvent::Element { element, .. } => {
                assert_eq!(element.local_name(), "features");
            }
            other => panic!("expected element, got {other:?}"),
        }

        server.await.unwrap();
        transport.close().await.unwrap();
        transport.wait_closed().await;
    }

    #[tokio::test]
    async fn test_send_without_open_is_illegal_state() {
        let transport = TcpTransport::new("127.0.0.1", 1, "example.org");
        let err = transport.send(Element::new("presence")).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_secure_without_upgrader_fails() {
        let transport = TcpTransport::new("127.0.0.1", 1, "example.org");
        let err = transport.secure().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
