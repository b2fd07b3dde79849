//! TLS ClientHello SNI peek
//!
//! HTTPS services share the multiplexed listener without TLS termination:
//! the only routable name is the server_name extension of the ClientHello,
//! which is read through the capture buffer and replayed untouched to the
//! tunneled service that owns the certificate.

use crate::VhostError;
use backhaul_connection::SharedConnection;
use tracing::trace;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
/// TLS plaintext records are capped at 2^14 bytes of payload.
const MAX_RECORD_LEN: usize = 16384 + 256;

/// Read the first TLS record and return the SNI hostname, lowercased.
///
/// Everything consumed stays in the capture buffer for replay. Any
/// malformed or non-handshake record is an extraction failure, which the
/// multiplexer treats as a routing miss.
pub async fn peek_tls_sni(shared: &mut SharedConnection) -> Result<String, VhostError> {
    let header = shared.read_exact(5).await?;
    if header[0] != RECORD_HANDSHAKE {
        return Err(VhostError::SniExtractionFailed);
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(VhostError::SniExtractionFailed);
    }

    let record = shared.read_exact(record_len).await?;
    let sni = extract_sni(&record)?;
    trace!(sni = %sni, "extracted SNI from ClientHello");
    Ok(sni.to_ascii_lowercase())
}

/// Walk a handshake record (record header already stripped) to the
/// server_name extension.
fn extract_sni(record: &[u8]) -> Result<String, VhostError> {
    let mut cur = Cursor::new(record);

    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(VhostError::SniExtractionFailed);
    }
    cur.skip(3)?; // handshake length
    cur.skip(2)?; // client version
    cur.skip(32)?; // random

    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len)?;

    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let extensions_len = cur.u16()? as usize;
    let mut extensions = Cursor::new(cur.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(ext_data);
        }
    }

    Err(VhostError::SniExtractionFailed)
}

fn parse_server_name(data: &[u8]) -> Result<String, VhostError> {
    let mut cur = Cursor::new(data);
    cur.skip(2)?; // server_name_list length
    if cur.u8()? != 0 {
        // only host_name entries are routable
        return Err(VhostError::SniExtractionFailed);
    }
    let name_len = cur.u16()? as usize;
    let name = cur.take(name_len)?;
    let hostname =
        std::str::from_utf8(name).map_err(|_| VhostError::SniExtractionFailed)?;
    if hostname.is_empty() {
        return Err(VhostError::SniExtractionFailed);
    }
    Ok(hostname.to_string())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, VhostError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(VhostError::SniExtractionFailed)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, VhostError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VhostError> {
        if self.remaining() < n {
            return Err(VhostError::SniExtractionFailed);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), VhostError> {
        self.take(n).map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Synthesize a minimal ClientHello record carrying one SNI entry.
    pub(crate) fn client_hello(hostname: &str) -> Vec<u8> {
        let server_name = {
            let mut v = Vec::new();
            let entry_len = 3 + hostname.len();
            v.extend_from_slice(&(entry_len as u16).to_be_bytes()); // list length
            v.push(0); // host_name
            v.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
            v.extend_from_slice(hostname.as_bytes());
            v
        };

        let mut extensions = Vec::new();
        // pad with an unrelated extension first so the walker has to scan
        extensions.extend_from_slice(&0x000au16.to_be_bytes());
        extensions.extend_from_slice(&2u16.to_be_bytes());
        extensions.extend_from_slice(&[0x00, 0x1d]);
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&server_name);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::client_hello;
    use super::*;
    use backhaul_connection::Connection;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn shared_with(bytes: &[u8]) -> SharedConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        client.write_all(bytes).await.unwrap();
        client.shutdown().await.unwrap();
        SharedConnection::new(Connection::from_stream(server))
    }

    #[tokio::test]
    async fn test_sni_extracted_and_lowercased() {
        let mut shared = shared_with(&client_hello("Secure.Example.Com")).await;
        let sni = peek_tls_sni(&mut shared).await.unwrap();
        assert_eq!(sni, "secure.example.com");
        // whole record captured for replay
        assert_eq!(shared.captured().to_vec(), client_hello("Secure.Example.Com"));
    }

    #[tokio::test]
    async fn test_no_sni_extension() {
        // strip extensions by synthesizing a hello for "" then corrupting
        let mut record = client_hello("x");
        // flip the extension type away from server_name
        let len = record.len();
        record[len - 10] = 0xff;
        let mut shared = shared_with(&record).await;
        assert!(matches!(
            peek_tls_sni(&mut shared).await,
            Err(VhostError::SniExtractionFailed)
        ));
    }

    #[tokio::test]
    async fn test_not_a_handshake() {
        let mut shared = shared_with(b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(matches!(
            peek_tls_sni(&mut shared).await,
            Err(VhostError::SniExtractionFailed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_record() {
        let mut record = client_hello("secure.example.com");
        record.truncate(20);
        let mut shared = shared_with(&record).await;
        // read_exact hits EOF before the declared record length
        assert!(peek_tls_sni(&mut shared).await.is_err());
    }

    #[test]
    fn test_extract_sni_rejects_garbage() {
        assert!(extract_sni(&[0x01, 0x00]).is_err());
        assert!(extract_sni(&[]).is_err());
        assert!(extract_sni(&[0x02; 64]).is_err());
    }
}
