use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::error::SmtpError;
use super::reply::{first_forward_address, parse_reply_line, SmtpReply};

/// Chunk size for `write_chunks`, in code units.
pub const CHUNK_SIZE: usize = 3000;

/// Maximum total RCPT attempts when chasing 551 forwards, including the
/// original attempt.
const MAX_RCPT_ATTEMPTS: usize = 21;

/// An open, HELO'd connection to one SMTP server. Carries no delivery state
/// of its own — the dispatcher's coalescing state machine (open DATA or
/// not, previous `(from, to)`) lives entirely in the caller.
pub struct SmtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
}

pub struct SmtpClient {
    helo_identity: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SmtpClient {
    pub fn new(helo_identity: String, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            helo_identity,
            connect_timeout,
            io_timeout,
        }
    }

    /// Connect and issue `HELO`. Success iff the greeting is `220` and the
    /// HELO reply is `250`.
    #[tracing::instrument(name = "Open an SMTP session", skip(self))]
    pub async fn open(&self, host: &str, port: u16) -> Result<(SmtpSession, SmtpReply), SmtpError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SmtpError::Local("connect timed out".into()))?
            .map_err(SmtpError::from_io)?;

        let (read_half, writer) = stream.into_split();
        let mut session = SmtpSession {
            reader: BufReader::new(read_half),
            writer,
            io_timeout: self.io_timeout,
        };

        let greeting = session.read_reply().await?;
        if !greeting.is(220) {
            return Err(SmtpError::from_reply(greeting, &[220]).unwrap_err());
        }

        let helo_identity = self.helo_identity.clone();
        let helo_reply = session
            .command(&format!("HELO {}", helo_identity))
            .await?;
        SmtpError::from_reply(helo_reply.clone(), &[250])?;

        Ok((session, helo_reply))
    }

    #[tracing::instrument(name = "MAIL FROM", skip(self, session))]
    pub async fn mail_from(
        &self,
        session: &mut SmtpSession,
        email: &str,
    ) -> Result<SmtpReply, SmtpError> {
        let reply = session.command(&format!("MAIL FROM:{}", email)).await?;
        SmtpError::from_reply(reply, &[250])
    }

    /// `RCPT TO`, chasing `551` forwards up to `MAX_RCPT_ATTEMPTS` times
    /// total. A reply outside `{250,251,551}` is returned immediately as a
    /// classified error; a 551 with no parseable forward address, or the
    /// final attempt's 551, is classified the same way — 551 never counts
    /// as acceptance of the recipient.
    #[tracing::instrument(name = "RCPT TO", skip(self, session))]
    pub async fn rcpt_to(
        &self,
        session: &mut SmtpSession,
        email: &str,
    ) -> Result<SmtpReply, SmtpError> {
        let mut target = email.to_string();

        for attempt in 1..=MAX_RCPT_ATTEMPTS {
            let reply = session.command(&format!("RCPT TO:{}", target)).await?;

            if reply.is_one_of(&[250, 251]) {
                return Ok(reply);
            }

            if reply.is(551) && attempt < MAX_RCPT_ATTEMPTS {
                if let Some(forward) = first_forward_address(&reply.text) {
                    target = forward.to_string();
                    continue;
                }
            }

            return SmtpError::from_reply(reply, &[250, 251]);
        }

        unreachable!("loop always returns within MAX_RCPT_ATTEMPTS iterations")
    }

    #[tracing::instrument(name = "DATA", skip(self, session))]
    pub async fn open_data(&self, session: &mut SmtpSession) -> Result<SmtpReply, SmtpError> {
        let reply = session.command("DATA").await?;
        SmtpError::from_reply(reply, &[354])
    }

    /// Write the fixed header block, title-cased day/month, then a
    /// blank line.
    pub async fn write_headers(
        &self,
        session: &mut SmtpSession,
        from: &str,
        to: &str,
        subject: &str,
        date: DateTime<Utc>,
    ) -> Result<(), SmtpError> {
        let formatted_date = format!("{}", date.format("%a, %d %b %Y %H:%M:%S"));

        self.write_string(
            session,
            &format!(
                "Date: {}\r\nFrom: {}\r\nTo: {}\r\nSubject:{}\r\nContent-type: text/plain\r\n\r\n",
                formatted_date, from, to, subject,
            ),
        )
        .await
    }

    pub async fn write_string(&self, session: &mut SmtpSession, s: &str) -> Result<(), SmtpError> {
        session.write_bytes(s.as_bytes()).await
    }

    /// Stream `blob` in fixed `CHUNK_SIZE`-code-unit slices, verbatim (no
    /// separators inserted between chunks).
    pub async fn write_chunks(&self, session: &mut SmtpSession, blob: &str) -> Result<(), SmtpError> {
        let chars: Vec<char> = blob.chars().collect();

        for chunk in chars.chunks(CHUNK_SIZE) {
            let piece: String = chunk.iter().collect();
            session.write_bytes(piece.as_bytes()).await?;
        }

        Ok(())
    }

    /// End the DATA section with the terminating `.` line and read the
    /// final reply; success is `250`.
    #[tracing::instrument(name = "Close DATA", skip(self, session))]
    pub async fn close_data(&self, session: &mut SmtpSession) -> Result<SmtpReply, SmtpError> {
        session.write_bytes(b"\r\n.\r\n").await?;
        let reply = session.read_reply().await?;
        SmtpError::from_reply(reply, &[250])
    }

    /// Best-effort `QUIT`; errors are ignored.
    #[tracing::instrument(name = "Close an SMTP session", skip(self, session))]
    pub async fn close(&self, session: &mut SmtpSession) {
        let _ = session.command("QUIT").await;
    }
}

impl SmtpSession {
    #[cfg(test)]
    pub(crate) fn for_test(reader: OwnedReadHalf, writer: OwnedWriteHalf, io_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            io_timeout,
        }
    }

    /// Write bytes verbatim, no terminator appended.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SmtpError> {
        tokio::time::timeout(self.io_timeout, self.writer.write_all(bytes))
            .await
            .map_err(|_| SmtpError::Local("write timed out".into()))?
            .map_err(SmtpError::from_io)
    }

    /// Write a command line terminated with CRLF and read the (possibly
    /// multi-line) reply.
    async fn command(&mut self, line: &str) -> Result<SmtpReply, SmtpError> {
        self.write_bytes(line.as_bytes()).await?;
        self.write_bytes(b"\r\n").await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<SmtpReply, SmtpError> {
        let mut code = 0u16;
        let mut text = String::new();

        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(self.io_timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::Local("read timed out".into()))?
                .map_err(SmtpError::from_io)?;

            if n == 0 {
                return Err(SmtpError::Local("connection closed by peer".into()));
            }

            let (line_code, line_text, is_final) = parse_reply_line(&line)
                .ok_or_else(|| SmtpError::Local(format!("unparseable reply line: {line:?}")))?;

            code = line_code;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(line_text);

            if is_final {
                break;
            }
        }

        Ok(SmtpReply::new(code, text))
    }
}
