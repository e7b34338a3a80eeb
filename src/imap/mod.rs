//! Hand-rolled IMAP session and connection pool (spec.md §4.4). The protocol
//! surface is deliberately narrow — LOGIN, LOGOUT, LIST, SELECT, UID SEARCH,
//! UID FETCH — and parsed by [`parse`] rather than a general-purpose IMAP
//! crate, since the wire format itself is first-party testable code here.
//! TLS setup is grounded on the teacher's `imap/mod.rs`; the session/command
//! loop is grounded on `original_source/imap/client.py`'s `ImapClient`/
//! `ImapPool`.

pub mod parse;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rustls_native_certs::load_native_certs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

use crate::errors::{AppError, AppResult};
use parse::SelectInfo;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Unifies the TLS stream (and, in principle, a plain one) behind one type so
/// `ImapSession` doesn't need to be generic over the transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A single authenticated IMAP connection, speaking a minimal tagged-command
/// subset of RFC 3501 over TLS.
pub struct ImapSession {
    reader: BufReader<ReadHalf<Box<dyn AsyncStream>>>,
    writer: WriteHalf<Box<dyn AsyncStream>>,
    tag_counter: u32,
    timeout: Duration,
}

impl ImapSession {
    /// Open a TLS connection to `host:port` and consume the server greeting.
    pub async fn connect(host: &str, port: u16) -> AppResult<Self> {
        let mut root_store = RootCertStore::empty();
        for cert in load_native_certs()
            .context("loading native root certificates")
            .map_err(|e| AppError::TransientIo(e.to_string()))?
        {
            root_store
                .add(&tokio_rustls::rustls::Certificate(cert.0))
                .map_err(|e| AppError::TransientIo(format!("adding root certificate: {e}")))?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| AppError::TransientIo(format!("connecting to {host}:{port}: {e}")))?;

        let server_name = ServerName::try_from(host)
            .map_err(|_| AppError::Config(format!("invalid IMAP host name: {host}")))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| AppError::TransientIo(format!("starting TLS for IMAP: {e}")))?;

        let boxed: Box<dyn AsyncStream> = Box::new(tls_stream);
        let (read_half, writer) = tokio::io::split(boxed);

        let mut session = ImapSession {
            reader: BufReader::new(read_half),
            writer,
            tag_counter: 0,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        };

        session.read_greeting().await?;
        Ok(session)
    }

    async fn read_greeting(&mut self) -> AppResult<()> {
        let line = self.read_literal_aware_line().await?;
        if line.starts_with(b"* OK") || line.starts_with(b"* PREAUTH") {
            Ok(())
        } else {
            Err(AppError::Parse(format!(
                "unexpected IMAP greeting: {}",
                String::from_utf8_lossy(&line)
            )))
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{:04}", self.tag_counter)
    }

    /// Read one logical response line, expanding a trailing `{N}` literal
    /// announcement into exactly N raw bytes followed by its terminating
    /// CRLF (spec.md §4.4).
    async fn read_literal_aware_line(&mut self) -> AppResult<Vec<u8>> {
        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| AppError::TransientIo(format!("reading IMAP line: {e}")))?;
        if n == 0 {
            return Err(AppError::TransientIo("IMAP connection closed".into()));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }

        if let Some(size) = trailing_literal_size(&line) {
            let mut payload = vec![0u8; size];
            tokio::io::AsyncReadExt::read_exact(&mut self.reader, &mut payload)
                .await
                .map_err(|e| AppError::TransientIo(format!("reading IMAP literal: {e}")))?;
            let mut trailer = Vec::new();
            self.reader
                .read_until(b'\n', &mut trailer)
                .await
                .map_err(|e| AppError::TransientIo(format!("reading IMAP literal trailer: {e}")))?;

            let mut combined = line;
            combined.push(b'\n');
            combined.extend_from_slice(&payload);
            return Ok(combined);
        }

        Ok(line)
    }

    /// Send a tagged command and collect every response line up to and
    /// including this command's tagged completion line.
    async fn command(&mut self, command: &str) -> AppResult<Vec<Vec<u8>>> {
        let tag = self.next_tag();
        let wire = format!("{tag} {command}\r\n");

        let fut = async {
            self.writer
                .write_all(wire.as_bytes())
                .await
                .map_err(|e| AppError::TransientIo(format!("writing IMAP command: {e}")))?;
            self.writer
                .flush()
                .await
                .map_err(|e| AppError::TransientIo(format!("flushing IMAP command: {e}")))?;

            let mut lines = Vec::new();
            loop {
                let line = self.read_literal_aware_line().await?;
                let is_tagged = line.starts_with(tag.as_bytes());
                let tagged_ok = is_tagged
                    && String::from_utf8_lossy(&line[tag.len()..])
                        .trim_start()
                        .to_ascii_uppercase()
                        .starts_with("OK");
                lines.push(line.clone());
                if is_tagged {
                    if !tagged_ok {
                        return Err(AppError::TransientIo(format!(
                            "IMAP command failed: {} -> {}",
                            command,
                            String::from_utf8_lossy(&line)
                        )));
                    }
                    break;
                }
            }
            Ok(lines)
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| AppError::TransientIo(format!("IMAP command timed out: {command}")))?
    }

    pub async fn login(&mut self, user: &str, password: &str) -> AppResult<()> {
        self.command(&format!("LOGIN {} {}", imap_quote(user), imap_quote(password)))
            .await?;
        Ok(())
    }

    pub async fn logout(&mut self) -> AppResult<()> {
        let _ = self.command("LOGOUT").await;
        Ok(())
    }

    pub async fn list_mailboxes(&mut self) -> AppResult<Vec<String>> {
        let lines = self.command(r#"LIST "" "*""#).await?;
        Ok(parse::parse_list_response(&lines))
    }

    pub async fn select(&mut self, mailbox: &str) -> AppResult<SelectInfo> {
        let lines = self.command(&format!("SELECT {}", imap_quote(mailbox))).await?;
        Ok(parse::parse_select_response(&lines))
    }

    /// Run `UID SEARCH` with a pre-tokenized criteria list (spec.md §4.4);
    /// callers build the list with [`parse::build_search_criteria`].
    pub async fn uid_search(&mut self, criteria: &[String]) -> AppResult<Vec<u32>> {
        let lines = self.command(&format!("UID SEARCH {}", criteria.join(" "))).await?;
        Ok(parse::parse_search_response(&lines))
    }

    pub async fn uid_fetch_rfc822(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        let lines = self.command(&format!("UID FETCH {uid} (BODY.PEEK[])")).await?;
        parse::extract_fetch_literal(&lines)
    }
}

/// Quote a string as an IMAP astring literal, escaping `\` and `"`.
fn imap_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn trailing_literal_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let trimmed = text.trim_end();
    if !trimmed.ends_with('}') {
        return None;
    }
    let open = trimmed.rfind('{')?;
    trimmed[open + 1..trimmed.len() - 1].parse().ok()
}

/// A fixed-size pool of logged-in [`ImapSession`]s (spec.md §5 IMAP fetch
/// concurrency bound), grounded on `original_source/imap/client.py`'s
/// `ImapPool`.
pub struct ImapPool {
    idle: Mutex<VecDeque<ImapSession>>,
    permits: Arc<Semaphore>,
}

impl ImapPool {
    /// Open `size` connections, log each in, and hold them ready for
    /// checkout.
    pub async fn connect(host: &str, port: u16, user: &str, password: &str, size: usize) -> AppResult<Self> {
        let mut sessions = VecDeque::with_capacity(size);
        for _ in 0..size {
            let mut session = ImapSession::connect(host, port).await?;
            session.login(user, password).await?;
            sessions.push_back(session);
        }
        Ok(ImapPool {
            idle: Mutex::new(sessions),
            permits: Arc::new(Semaphore::new(size)),
        })
    }

    /// Borrow a session from the pool, blocking until one is free.
    pub async fn checkout(self: &Arc<Self>) -> AppResult<PooledSession> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Unexpected(format!("imap pool semaphore closed: {e}")))?;
        let session = self
            .idle
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| AppError::Unexpected("imap pool exhausted despite available permit".into()))?;
        Ok(PooledSession {
            pool: self.clone(),
            session: Some(session),
            _permit: permit,
        })
    }

    async fn release(&self, session: ImapSession) {
        self.idle.lock().await.push_back(session);
    }

    /// Log out every idle session. Callers must return all checked-out
    /// sessions (let their [`PooledSession`] guards drop) before calling
    /// this, or those connections leak open.
    pub async fn logout_all(&self) {
        let mut idle = self.idle.lock().await;
        while let Some(mut session) = idle.pop_front() {
            let _ = session.logout().await;
        }
    }
}

/// RAII handle returned by [`ImapPool::checkout`]; the session returns to the
/// pool's idle queue when dropped.
pub struct PooledSession {
    pool: Arc<ImapPool>,
    session: Option<ImapSession>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledSession {
    type Target = ImapSession;
    fn deref(&self) -> &ImapSession {
        self.session.as_ref().expect("session taken before drop")
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut ImapSession {
        self.session.as_mut().expect("session taken before drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(session).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_size_detection() {
        assert_eq!(trailing_literal_size(b"* LIST (\\HasNoChildren) \"/\" {12}"), Some(12));
        assert_eq!(trailing_literal_size(b"* 1 FETCH (UID 5 BODY[] {70}"), Some(70));
        assert_eq!(trailing_literal_size(b"A0001 OK LOGIN completed"), None);
    }

    #[test]
    fn quoting_escapes_backslash_and_quote() {
        assert_eq!(imap_quote("simple"), "\"simple\"");
        assert_eq!(imap_quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }
}
