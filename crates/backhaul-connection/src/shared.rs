//! Tee-capturing reader for routing peeks
//!
//! The virtual-host multiplexer must parse the first bytes of a connection
//! (request line and headers, or a TLS record) and then hand those same
//! bytes onward to whichever service wins the route. `SharedConnection`
//! records everything read through it; the captured prefix is pushed back
//! with `Connection::unread` once routing is done, so the recipient sees
//! the byte stream exactly as the client sent it.

use crate::connection::{ConnError, Connection};
use bytes::BytesMut;

pub struct SharedConnection {
    conn: Connection,
    captured: BytesMut,
}

impl SharedConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            captured: BytesMut::new(),
        }
    }

    /// Read one line, terminator stripped; the raw bytes land in the
    /// capture buffer. Returns `None` on EOF.
    pub async fn read_line(&mut self) -> Result<Option<String>, ConnError> {
        match self.conn.read_line_raw().await? {
            None => Ok(None),
            Some(raw) => {
                self.captured.extend_from_slice(&raw);
                let text = String::from_utf8_lossy(&raw);
                Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
            }
        }
    }

    /// Read exactly `n` bytes into the capture buffer and return them.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ConnError> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.conn.read(&mut out[filled..]).await?;
            if got == 0 {
                return Err(ConnError::Closed);
            }
            filled += got;
        }
        self.captured.extend_from_slice(&out);
        Ok(out)
    }

    /// Everything read through this wrapper so far.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Split back into the connection and the captured prefix. The caller
    /// decides what to `unread` (the prefix verbatim, or a rewritten form).
    pub fn into_parts(self) -> (Connection, BytesMut) {
        (self.conn, self.captured)
    }

    /// Reunite the captured prefix with the connection unchanged.
    pub async fn replay(self) -> Connection {
        let (conn, captured) = self.into_parts();
        conn.unread(&captured).await;
        conn
    }
}
