//! Line-oriented, close-once TCP connection wrapper

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

/// How long `check_closed` is allowed to block.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection already closed")]
    Closed,

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),
}

struct ConnReader {
    /// Bytes pushed back with `unread`, served before the socket
    unread: BytesMut,
    inner: BufReader<OwnedReadHalf>,
}

/// A bidirectional byte stream with buffered line reads and idempotent close.
///
/// Reads and writes take `&self`; the two halves are independently locked so
/// a reader task and a writer task never contend. `close` may be called any
/// number of times from any task; only the first call shuts the socket down.
pub struct Connection {
    reader: Mutex<ConnReader>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Open an outbound connection.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ConnError> {
        let stream = TcpStream::connect((host, port)).await?;
        trace!("connected to {}:{}", host, port);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-accepted stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: Mutex::new(ConnReader {
                unread: BytesMut::new(),
                inner: BufReader::new(read_half),
            }),
            writer: Mutex::new(Some(write_half)),
            local_addr,
            peer_addr,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Read one line as raw bytes, terminator included.
    ///
    /// Returns `Ok(None)` on clean EOF with nothing buffered; a final
    /// unterminated line is returned as-is. EOF and connection-reset both
    /// flip the closed flag.
    pub async fn read_line_raw(&self) -> Result<Option<Vec<u8>>, ConnError> {
        let mut reader = self.reader.lock().await;
        let mut line: Vec<u8> = Vec::new();

        // Replayed bytes may already hold a full line.
        if !reader.unread.is_empty() {
            if let Some(pos) = reader.unread.iter().position(|&b| b == b'\n') {
                let chunk = reader.unread.split_to(pos + 1);
                return Ok(Some(chunk.to_vec()));
            }
            let rest = reader.unread.split();
            line.extend_from_slice(&rest);
        }

        match reader.inner.read_until(b'\n', &mut line).await {
            Ok(_) => {}
            Err(e) => {
                if is_reset(&e) {
                    self.closed.store(true, Ordering::SeqCst);
                }
                return Err(e.into());
            }
        }

        if line.is_empty() {
            self.closed.store(true, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Buffered read up to the next newline, terminator stripped.
    pub async fn read_line(&self) -> Result<Option<String>, ConnError> {
        match self.read_line_raw().await? {
            None => Ok(None),
            Some(raw) => {
                let text = String::from_utf8_lossy(&raw);
                Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
            }
        }
    }

    /// `read_line` bounded by `dur`.
    pub async fn read_line_timeout(&self, dur: Duration) -> Result<Option<String>, ConnError> {
        timeout(dur, self.read_line())
            .await
            .map_err(|_| ConnError::Timeout(dur))?
    }

    /// Read into `buf`, serving replayed bytes before the socket.
    /// Returns 0 on EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let mut reader = self.reader.lock().await;

        if !reader.unread.is_empty() {
            let n = reader.unread.len().min(buf.len());
            let chunk = reader.unread.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            return Ok(n);
        }

        match reader.inner.read(buf).await {
            Ok(0) => {
                self.closed.store(true, Ordering::SeqCst);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                if is_reset(&e) {
                    self.closed.store(true, Ordering::SeqCst);
                }
                Err(e.into())
            }
        }
    }

    /// Push bytes back so they are served by subsequent reads, before
    /// anything still on the wire.
    pub async fn unread(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut reader = self.reader.lock().await;
        let mut merged = BytesMut::with_capacity(bytes.len() + reader.unread.len());
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&reader.unread);
        reader.unread = merged;
    }

    /// Write all of `bytes`, returning the byte count.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, ConnError> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(ConnError::Closed)?;
        w.write_all(bytes).await?;
        Ok(bytes.len())
    }

    /// Write a line, appending the terminator when absent.
    pub async fn write_line(&self, line: &str) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(ConnError::Closed)?;
        w.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            w.write_all(b"\n").await?;
        }
        Ok(())
    }

    /// Close the write side and mark the connection closed. Idempotent and
    /// safe to call concurrently; closing twice is a no-op. Reads already
    /// in flight drain whatever the peer still sends.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let half = self.writer.lock().await.take();
        if let Some(mut w) = half {
            if let Err(e) = w.shutdown().await {
                trace!("shutdown after close: {}", e);
            }
            debug!("connection to {:?} closed", self.peer_addr);
        }
    }

    /// Flag-only check, no I/O.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Active liveness probe, bounded by ~1ms.
    ///
    /// Only valid on a connection pulled from an idle pool: a silent peer
    /// makes the probe time out (alive), a dead peer yields immediate EOF.
    /// Bytes that do arrive during the probe stay buffered and are seen by
    /// the next read, so the race with real traffic loses nothing, but the
    /// verdict is only meaningful when the wire is expected to be quiet.
    pub async fn check_closed(&self) -> bool {
        if self.is_closed() {
            return true;
        }

        let mut reader = self.reader.lock().await;
        if !reader.unread.is_empty() {
            return false;
        }

        match timeout(PROBE_TIMEOUT, reader.inner.fill_buf()).await {
            // probe deadline hit: nothing to read, peer is just quiet
            Err(_) => false,
            Ok(Ok(buf)) => {
                if buf.is_empty() {
                    self.closed.store(true, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
            Ok(Err(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                true
            }
        }
    }
}

fn is_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::from_stream(server), client)
    }

    #[tokio::test]
    async fn test_read_line() {
        let (conn, mut peer) = pair().await;
        peer.write_all(b"hello\nworld\r\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), Some("hello".to_string()));
        assert_eq!(conn.read_line().await.unwrap(), Some("world".to_string()));
    }

    #[tokio::test]
    async fn test_read_line_eof_sets_closed() {
        let (conn, peer) = pair().await;
        drop(peer);

        assert_eq!(conn.read_line().await.unwrap(), None);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_unterminated_final_line() {
        let (conn, mut peer) = pair().await;
        peer.write_all(b"partial").await.unwrap();
        peer.shutdown().await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), Some("partial".to_string()));
        assert_eq!(conn.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unread_replays_before_socket() {
        let (conn, mut peer) = pair().await;
        peer.write_all(b"tail").await.unwrap();

        conn.unread(b"head ").await;

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 9 {
            let n = conn.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"head tail");
    }

    #[tokio::test]
    async fn test_unread_line_boundary() {
        let (conn, mut peer) = pair().await;
        peer.write_all(b"rest\n").await.unwrap();

        conn.unread(b"first\nsecond ").await;
        assert_eq!(conn.read_line().await.unwrap(), Some("first".to_string()));
        assert_eq!(
            conn.read_line().await.unwrap(),
            Some("second rest".to_string())
        );
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (conn, _peer) = pair().await;

        conn.close().await;
        assert!(conn.is_closed());
        // double close is a no-op, not an error
        conn.close().await;
        assert!(conn.is_closed());

        assert!(matches!(conn.write(b"x").await, Err(ConnError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (conn, _peer) = pair().await;
        let conn = std::sync::Arc::new(conn);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = conn.clone();
            handles.push(tokio::spawn(async move { c.close().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_check_closed_alive() {
        let (conn, _peer) = pair().await;
        assert!(!conn.check_closed().await);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_check_closed_dead() {
        let (conn, peer) = pair().await;
        drop(peer);
        // give the FIN a moment to land
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(conn.check_closed().await);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_check_closed_keeps_buffered_bytes() {
        let (conn, mut peer) = pair().await;
        peer.write_all(b"data\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // bytes on the wire: probe says alive and must not eat them
        assert!(!conn.check_closed().await);
        assert_eq!(conn.read_line().await.unwrap(), Some("data".to_string()));
    }

    #[tokio::test]
    async fn test_read_line_timeout() {
        let (conn, _peer) = pair().await;
        let err = conn
            .read_line_timeout(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let (conn, mut peer) = pair().await;
        conn.write_line("ping").await.unwrap();
        conn.write_line("pong\n").await.unwrap();

        let mut buf = vec![0u8; 16];
        let mut got = Vec::new();
        while got.len() < 10 {
            let n = peer.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"ping\npong\n");
    }
}
