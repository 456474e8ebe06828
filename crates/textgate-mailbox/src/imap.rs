//! Minimal async IMAP client over TLS.
//!
//! Supports exactly the commands the invitation flow needs: LOGIN,
//! SELECT, SEARCH (by subject and date window), FETCH (RFC822),
//! STORE +FLAGS (\Deleted), EXPUNGE, LOGOUT. Sequence numbers are used
//! throughout; searches return them sorted descending so the newest
//! invites are processed first.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use textgate_core::error::{Error, Result};

const IMAPS_PORT: u16 = 993;

/// Raw IMAP session plumbing: line reader, writer, tag counter.
struct ImapClient {
    reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    tag_counter: u32,
}

impl ImapClient {
    async fn connect(host: &str) -> Result<Self> {
        let tcp = TcpStream::connect((host, IMAPS_PORT)).await?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| Error::Imap(format!("invalid server name '{host}': {e}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Imap(format!("tls handshake with {host} failed: {e}")))?;

        let (read, write) = tokio::io::split(tls);
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
            tag_counter: 0,
        };

        let greeting = client.read_line().await?;
        if !greeting.to_uppercase().starts_with("* OK") {
            return Err(Error::Imap(format!("unexpected greeting: {greeting}")));
        }
        debug!(host, "imap connected");
        Ok(client)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Imap("connection closed unexpectedly".to_string()));
        }
        Ok(line
            .trim_end_matches("\r\n")
            .trim_end_matches('\n')
            .to_string())
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn send_command(&mut self, cmd: &str) -> Result<String> {
        self.tag_counter += 1;
        let tag = format!("A{:04}", self.tag_counter);
        let line = format!("{tag} {cmd}\r\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(tag)
    }

    /// Read untagged responses until the tagged completion line.
    async fn read_response(&mut self, tag: &str) -> Result<(Vec<String>, String)> {
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.starts_with(tag) {
                return Ok((untagged, line));
            }
            untagged.push(line);
        }
    }

    async fn expect_ok(&mut self, cmd: &str) -> Result<Vec<String>> {
        let tag = self.send_command(cmd).await?;
        let (untagged, status) = self.read_response(&tag).await?;
        if !status.to_uppercase().contains("OK") {
            let verb = cmd.split_whitespace().next().unwrap_or(cmd);
            return Err(Error::Imap(format!("{verb} failed: {status}")));
        }
        Ok(untagged)
    }

    async fn login(&mut self, user: &str, pass: &str) -> Result<()> {
        let cmd = format!(
            "LOGIN \"{}\" \"{}\"",
            user.replace('\\', "\\\\").replace('"', "\\\""),
            pass.replace('\\', "\\\\").replace('"', "\\\""),
        );
        self.expect_ok(&cmd).await?;
        Ok(())
    }

    async fn select_inbox(&mut self) -> Result<()> {
        self.expect_ok("SELECT \"inbox\"").await?;
        Ok(())
    }

    async fn search(&mut self, query: &str) -> Result<Vec<u32>> {
        let lines = self.expect_ok(&format!("SEARCH {query}")).await?;
        let mut seqnums = Vec::new();
        for line in &lines {
            if line.to_uppercase().starts_with("* SEARCH") {
                seqnums.extend(
                    line.split_whitespace()
                        .skip(2)
                        .filter_map(|s| s.parse::<u32>().ok()),
                );
            }
        }
        Ok(seqnums)
    }

    /// FETCH the full RFC822 payload of one message.
    async fn fetch_rfc822(&mut self, seqnum: u32) -> Result<Vec<u8>> {
        let tag = self.send_command(&format!("FETCH {seqnum} (RFC822)")).await?;

        let mut payload = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.starts_with(&tag) {
                if !line.to_uppercase().contains("OK") {
                    return Err(Error::Imap(format!("FETCH failed: {line}")));
                }
                break;
            }
            if line.starts_with("* ") && line.to_uppercase().contains("FETCH") {
                if let (Some(open), Some(close)) = (line.rfind('{'), line.rfind('}')) {
                    if close > open {
                        if let Ok(size) = line[open + 1..close].parse::<usize>() {
                            payload = self.read_exact(size).await?;
                            let _closing = self.read_line().await?;
                        }
                    }
                }
            }
        }

        if payload.is_empty() {
            return Err(Error::Imap(format!("no payload for message {seqnum}")));
        }
        Ok(payload)
    }

    async fn store_deleted(&mut self, seqnum: u32) -> Result<()> {
        self.expect_ok(&format!("STORE {seqnum} +FLAGS (\\Deleted)"))
            .await?;
        Ok(())
    }

    async fn expunge(&mut self) -> Result<()> {
        self.expect_ok("EXPUNGE").await?;
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        let tag = self.send_command("LOGOUT").await?;
        // Server may send * BYE before the tagged OK.
        let _ = self.read_response(&tag).await;
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Mailbox
// ─────────────────────────────────────────────

/// An open, logged-in mailbox with the inbox selected.
pub struct Mailbox {
    client: ImapClient,
    host: String,
}

/// `SINCE` cutoff for a day window, in IMAP date syntax.
pub fn since_date(days_back: u32) -> String {
    (Utc::now() - Duration::days(i64::from(days_back)))
        .format("%d-%b-%Y")
        .to_string()
}

/// Full search query for a subject within the day window.
pub fn subject_query(subject: &str, days_back: u32) -> String {
    format!("SUBJECT \"{}\" SINCE {}", subject, since_date(days_back))
}

impl Mailbox {
    /// Connect, log in, and select the inbox.
    pub async fn open(host: &str, username: &str, password: &str) -> Result<Self> {
        let mut client = ImapClient::connect(host).await?;
        client.login(username, password).await?;
        client.select_inbox().await?;
        info!(host, username, "mailbox opened");
        Ok(Self {
            client,
            host: host.to_string(),
        })
    }

    /// Search for a subject in the day window, falling back to the
    /// broader subject when the exact one matches nothing. Results are
    /// sorted descending (newest first).
    pub async fn search_invites(
        &mut self,
        days_back: u32,
        subject: &str,
        fallback_subject: &str,
    ) -> Result<Vec<u32>> {
        let mut ids = self
            .client
            .search(&subject_query(subject, days_back))
            .await?;
        if ids.is_empty() {
            debug!(host = %self.host, "exact subject found nothing, trying broader search");
            ids = self
                .client
                .search(&subject_query(fallback_subject, days_back))
                .await?;
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        info!(host = %self.host, count = ids.len(), "invite search finished");
        Ok(ids)
    }

    /// Fetch the raw RFC822 payload of one message.
    pub async fn fetch(&mut self, seqnum: u32) -> Result<Vec<u8>> {
        self.client.fetch_rfc822(seqnum).await
    }

    /// Flag a message deleted and expunge it.
    pub async fn delete(&mut self, seqnum: u32) -> Result<()> {
        self.client.store_deleted(seqnum).await?;
        self.client.expunge().await?;
        info!(host = %self.host, seqnum, "deleted invite email");
        Ok(())
    }

    /// Log out, swallowing errors — the session is done either way.
    pub async fn close(mut self) {
        if let Err(e) = self.client.logout().await {
            warn!(host = %self.host, error = %e, "imap logout error (non-fatal)");
        }
    }
}
