//! TLS ClientHello peeking.
//!
//! HTTPS dispatch needs the SNI hostname before a certificate can be
//! chosen, so the handler reads the ClientHello record off the socket,
//! extracts the server name, and then replays the buffered bytes into the
//! TLS acceptor through [`ReplayStream`] so the handshake sees the exact
//! byte sequence the client sent.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Upper bound on how much of the connection is buffered while peeking.
const MAX_HELLO_BYTES: usize = 16 * 1024;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_HOSTNAME: u8 = 0;

/// Read the first TLS record from `stream` and extract the SNI hostname.
///
/// Returns the hostname (lowercased, trailing dot trimmed) when the bytes
/// form a ClientHello carrying one, and always returns whatever was
/// consumed so the caller can replay it.
pub async fn peek_client_hello<R>(stream: &mut R) -> io::Result<(Option<String>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RECORD_HEADER_LEN];
    let mut read = 0;
    while read < RECORD_HEADER_LEN {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            buf.truncate(read);
            return Ok((None, buf));
        }
        read += n;
    }

    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok((None, buf));
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total = (RECORD_HEADER_LEN + record_len).min(MAX_HELLO_BYTES);
    buf.resize(total, 0);
    while read < total {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);

    Ok((extract_sni(&buf), buf))
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}

/// Walk a buffered TLS record and pull the SNI hostname out of the
/// ClientHello extensions. Any structural surprise yields `None`.
fn extract_sni(data: &[u8]) -> Option<String> {
    if *data.first()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let handshake = data.get(RECORD_HEADER_LEN..)?;
    if *handshake.first()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }

    // Handshake header: type(1) + length(3).
    let hello = handshake.get(4..)?;

    // client version(2) + random(32)
    let mut pos = 34;
    let session_len = *hello.get(pos)? as usize;
    pos += 1 + session_len;

    let suites_len = read_u16(hello, pos)? as usize;
    pos += 2 + suites_len;

    let compression_len = *hello.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(hello, pos)? as usize;
    pos += 2;
    let end = (pos + extensions_len).min(hello.len());

    while pos + 4 <= end {
        let ext_type = read_u16(hello, pos)?;
        let ext_len = read_u16(hello, pos + 2)? as usize;
        pos += 4;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(hello.get(pos..pos.checked_add(ext_len)?)?);
        }
        pos += ext_len;
    }
    None
}

/// Server-name extension body: list length, then (type, length, name)
/// entries; only the hostname type is meaningful.
fn parse_server_name(data: &[u8]) -> Option<String> {
    let list_len = read_u16(data, 0)? as usize;
    let end = (2 + list_len).min(data.len());
    let mut pos = 2;
    while pos + 3 <= end {
        let name_type = *data.get(pos)?;
        let name_len = read_u16(data, pos + 1)? as usize;
        pos += 3;
        if name_type == SERVER_NAME_HOSTNAME {
            let raw = data.get(pos..pos.checked_add(name_len)?)?;
            let name = std::str::from_utf8(raw).ok()?;
            return Some(name.trim_end_matches('.').to_ascii_lowercase());
        }
        pos += name_len;
    }
    None
}

/// A stream that yields a buffered prefix before reading from the
/// underlying connection. Writes pass straight through.
pub struct ReplayStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Assemble a minimal ClientHello record, optionally carrying SNI.
    fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // empty session id
        hello.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let name = name.as_bytes();
            let mut body = Vec::new();
            body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
            body.push(SERVER_NAME_HOSTNAME);
            body.extend_from_slice(&(name.len() as u16).to_be_bytes());
            body.extend_from_slice(name);

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&body);
        }
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_hostname() {
        let record = client_hello(Some("Secure.Example."));
        assert_eq!(extract_sni(&record), Some("secure.example".to_string()));
    }

    #[test]
    fn hello_without_sni_yields_none() {
        let record = client_hello(None);
        assert_eq!(extract_sni(&record), None);
    }

    #[test]
    fn plain_http_is_not_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n"), None);
    }

    #[test]
    fn truncated_record_yields_none() {
        let mut record = client_hello(Some("secure.example"));
        record.truncate(20);
        assert_eq!(extract_sni(&record), None);
    }

    #[tokio::test]
    async fn peek_preserves_bytes_for_replay() {
        let record = client_hello(Some("secure.example"));
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&record).await.unwrap();

        let (sni, buffered) = peek_client_hello(&mut server).await.unwrap();
        assert_eq!(sni, Some("secure.example".to_string()));
        assert_eq!(buffered, record);

        // Trailing application bytes flow through after the replayed prefix.
        client.write_all(b"tail").await.unwrap();
        drop(client);
        let mut replay = ReplayStream::new(buffered.clone(), server);
        let mut all = Vec::new();
        replay.read_to_end(&mut all).await.unwrap();
        let mut expected = buffered;
        expected.extend_from_slice(b"tail");
        assert_eq!(all, expected);
    }
}
