use crate::access::{permit, AllowList};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::forward::{Forwarder, MailApi};
use crate::message::{self, ParsedMessage};
use crate::session::{SessionState, SmtpSession};
use crate::utils::{Logger, NO_PEER};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const FORWARDED: &str = "250 2.0.0 OK: message forwarded\r\n";
const SHUTTING_DOWN: &str = "421 4.3.2 Service shutting down\r\n";
const LINE_TOO_LONG: &str = "500 5.5.6 Error: line too long\r\n";

/// Longest command line accepted, CRLF included.
const MAX_COMMAND_LINE: usize = 1024;

/// Chunk size used while skipping the rest of an over-long line.
const DISCARD_CHUNK: usize = 8192;

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    TooLong,
}

pub struct SmtpRelay {
    hostname: String,
    allow_list: AllowList,
    forwarder: Forwarder,
    max_message_size: usize,
    logger: Logger,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl SmtpRelay {
    pub fn new(config: &RelayConfig, api: Arc<dyn MailApi>, logger: Logger) -> Self {
        Self {
            hostname: config.hostname.clone(),
            allow_list: config.allow_list.clone(),
            forwarder: Forwarder::new(api, &config.sender, config.save_to_sent_items),
            max_message_size: config.max_message_size,
            logger,
            tls_acceptor: None,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Offers STARTTLS to peers.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn identity(&self) -> &str {
        self.forwarder.identity()
    }

    /// Stops accepting connections; idle sessions are closed, sessions in the
    /// middle of a transaction finish it first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn reply<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        client_addr: &SocketAddr,
        response: &str,
    ) -> std::io::Result<()> {
        self.logger.log_verbose(client_addr, "<<", response).await;
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await
    }

    fn ehlo_response(&self, client_name: &str, session: &SmtpSession) -> String {
        let mut lines = vec![
            format!("{} Hello {}", self.hostname, client_name),
            format!("SIZE {}", self.max_message_size),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.tls_acceptor.is_some() && !session.tls_active {
            lines.push("STARTTLS".to_string());
        }
        lines.push("HELP".to_string());

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("250{}{}\r\n", if i == last { ' ' } else { '-' }, line))
            .collect()
    }

    async fn process_command(&self, cmd_line: &str, session: &mut SmtpSession) -> String {
        let (verb, param) = match cmd_line.split_once(' ') {
            Some((verb, param)) => (verb, param.trim()),
            None => (cmd_line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" | "EHLO" => {
                if param.is_empty() {
                    return format!("501 5.5.4 Syntax: {} hostname\r\n", verb.to_ascii_uppercase());
                }
                session.helo = Some(param.to_string());
                session.reset();
                if verb.eq_ignore_ascii_case("EHLO") {
                    self.ehlo_response(param, session)
                } else {
                    format!("250 {} Hello {}\r\n", self.hostname, param)
                }
            }

            "MAIL" => {
                if session.helo.is_none() {
                    return "503 5.5.1 Error: send HELO/EHLO first\r\n".to_string();
                }
                if session.mail_from.is_some() {
                    return "503 5.5.1 Error: nested MAIL command\r\n".to_string();
                }
                let Some((from, params)) = envelope_argument(param, "FROM:") else {
                    return "501 5.5.4 Syntax: MAIL FROM:<address>\r\n".to_string();
                };
                if declared_size(params).is_some_and(|size| size > self.max_message_size) {
                    return "552 5.3.4 Message size exceeds fixed limit\r\n".to_string();
                }
                self.logger
                    .log_verbose(&session.client_addr, "MAIL FROM", &from)
                    .await;
                session.begin_envelope(from);
                "250 2.1.0 OK\r\n".to_string()
            }

            "RCPT" => {
                if session.mail_from.is_none() {
                    return "503 5.5.1 Error: need MAIL command\r\n".to_string();
                }
                match envelope_argument(param, "TO:") {
                    Some((to, _)) if !to.is_empty() => {
                        self.logger
                            .log_verbose(&session.client_addr, "RCPT TO", &to)
                            .await;
                        session.add_recipient(to);
                        "250 2.1.5 OK\r\n".to_string()
                    }
                    _ => "501 5.5.4 Syntax: RCPT TO:<address>\r\n".to_string(),
                }
            }

            "DATA" => {
                if session.mail_from.is_none() {
                    return "503 5.5.1 Error: need MAIL command\r\n".to_string();
                }
                if session.rcpt_to.is_empty() {
                    return "503 5.5.1 Error: need RCPT command\r\n".to_string();
                }
                session.begin_data();
                "354 End data with <CR><LF>.<CR><LF>\r\n".to_string()
            }

            "STARTTLS" => {
                if self.tls_acceptor.is_some() && !session.tls_active {
                    "220 2.0.0 Ready to start TLS\r\n".to_string()
                } else {
                    "454 4.7.0 TLS not available\r\n".to_string()
                }
            }

            "RSET" => {
                session.reset();
                "250 2.0.0 OK\r\n".to_string()
            }

            "NOOP" => "250 2.0.0 OK\r\n".to_string(),

            "VRFY" => "252 2.5.0 Cannot VRFY user\r\n".to_string(),

            "HELP" => "214 2.0.0 Commands: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY STARTTLS QUIT\r\n"
                .to_string(),

            "AUTH" => "502 5.5.1 Error: authentication not enabled\r\n".to_string(),

            "QUIT" => "221 2.0.0 Bye\r\n".to_string(),

            "" => "500 5.5.2 Error: bad syntax\r\n".to_string(),

            _ => "500 5.5.2 Error: command not recognized\r\n".to_string(),
        }
    }

    /// Parses, validates and forwards the buffered DATA.
    async fn deliver(&self, session: &mut SmtpSession) -> Result<ParsedMessage, RelayError> {
        if session.data_overflow {
            session.take_data();
            return Err(RelayError::MessageTooLarge {
                max: self.max_message_size,
            });
        }

        let message = message::parse_async(session.take_data()).await?;
        message.validate()?;
        self.forwarder.forward(&message).await?;
        Ok(message)
    }

    async fn finish_transaction(&self, session: &mut SmtpSession) -> String {
        let client_addr = session.client_addr;
        let response = match self.deliver(session).await {
            Ok(message) => {
                session.complete();
                self.logger
                    .log(
                        &client_addr,
                        &format!(
                            "Mail from Server {} has been forwarded via {} to {}",
                            client_addr.ip(),
                            self.forwarder.identity(),
                            message.recipient_list()
                        ),
                    )
                    .await;
                FORWARDED.to_string()
            }
            Err(e) => {
                session.fail();
                let context = match &e {
                    RelayError::ParseFailure(_) => "Error parsing email",
                    RelayError::ForwardFailure(_) => "Error sending email via mail API",
                    _ => "Message rejected",
                };
                self.logger
                    .error(&client_addr, &format!("{}: {}", context, e))
                    .await;
                e.to_response()
            }
        };
        session.reset();
        response
    }

    /// Reads DATA lines up to the terminating dot. Returns `false` if the
    /// peer went away first.
    async fn receive_data<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
        session: &mut SmtpSession,
    ) -> std::io::Result<bool> {
        // Room for the whole message on one line, plus dot-stuffing and CRLF.
        let limit = self.max_message_size.saturating_add(3);
        let mut line = Vec::new();
        loop {
            line.clear();
            match read_line_limited(reader, &mut line, limit).await? {
                LineRead::Eof => return Ok(false),
                LineRead::TooLong => {
                    session.mark_overflow();
                    continue;
                }
                LineRead::Line => {}
            }
            if line == b".\r\n" || line == b".\n" {
                return Ok(true);
            }
            let content = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
            session.push_data(content, self.max_message_size);
        }
    }

    /// Runs the command loop. Returns the stream back when the peer asked
    /// for STARTTLS.
    async fn run_session<S>(&self, stream: S, session: &mut SmtpSession) -> Result<Option<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let client_addr = session.client_addr;
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        if !session.tls_active {
            let banner = format!("220 {} ESMTP ready\r\n", self.hostname);
            self.reply(&mut writer, &client_addr, &banner).await?;
        }

        let mut line = Vec::new();

        loop {
            line.clear();

            let read = tokio::select! {
                _ = self.shutdown.cancelled(), if !session.in_transaction() => {
                    self.reply(&mut writer, &client_addr, SHUTTING_DOWN).await?;
                    break;
                }
                read = read_line_limited(&mut reader, &mut line, MAX_COMMAND_LINE) => read,
            };

            match read {
                Ok(LineRead::Eof) => break,
                Ok(LineRead::TooLong) => {
                    self.logger
                        .log_verbose(&client_addr, ">>", "(over-long command line discarded)")
                        .await;
                    self.reply(&mut writer, &client_addr, LINE_TOO_LONG).await?;
                }
                Ok(LineRead::Line) => {
                    let cmd_line = String::from_utf8_lossy(&line);
                    let cmd_line = cmd_line.trim_end();
                    self.logger.log_verbose(&client_addr, ">>", cmd_line).await;

                    let response = self.process_command(cmd_line, session).await;
                    self.reply(&mut writer, &client_addr, &response).await?;

                    if response.starts_with("221") {
                        break;
                    }

                    if response.starts_with("354") {
                        if !self.receive_data(&mut reader, session).await? {
                            self.logger
                                .log(&client_addr, "Connection lost during DATA")
                                .await;
                            session.reset();
                            break;
                        }
                        let response = self.finish_transaction(session).await;
                        self.reply(&mut writer, &client_addr, &response).await?;
                    }

                    if response.starts_with("220") {
                        if !reader.buffer().is_empty() {
                            return Err(anyhow::anyhow!("Data pipelined after STARTTLS"));
                        }
                        return Ok(Some(reader.into_inner().unsplit(writer)));
                    }
                }
                Err(e) => {
                    self.logger
                        .error(&client_addr, &format!("Read error: {}", e))
                        .await;
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        Ok(None)
    }

    /// Drives one connection from admission to teardown.
    pub async fn handle_client<S>(&self, mut stream: S, client_addr: SocketAddr) -> Result<SessionState>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = SmtpSession::new(client_addr);
        self.logger
            .log(&client_addr, &format!("New connection attempt from: {}", client_addr.ip()))
            .await;

        if !permit(&client_addr.ip(), &self.allow_list) {
            session.reject();
            let err = RelayError::AccessDenied(client_addr.ip());
            self.logger.log(&client_addr, &err.to_string()).await;
            self.reply(&mut stream, &client_addr, &err.to_response()).await?;
            let _ = stream.shutdown().await;
            return Ok(session.outcome());
        }

        session.admit();
        self.logger
            .log(&client_addr, &format!("Connection accepted from: {}", client_addr.ip()))
            .await;

        let result = match self.run_session(stream, &mut session).await {
            Ok(Some(stream)) => self.upgrade(stream, &mut session).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        self.logger.log(&client_addr, "Connection closed").await;
        result.map(|()| session.outcome())
    }

    async fn upgrade<S>(&self, stream: S, session: &mut SmtpSession) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(acceptor) = &self.tls_acceptor else {
            return Ok(());
        };

        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                self.logger
                    .log(&session.client_addr, "TLS session established")
                    .await;
                session.reset_all();
                session.tls_active = true;
                self.run_session(tls_stream, session).await.map(|_| ())
            }
            Err(e) => {
                self.logger
                    .error(&session.client_addr, &format!("TLS handshake failed: {}", e))
                    .await;
                Ok(())
            }
        }
    }

    /// Accepts connections until [`shutdown`](Self::shutdown), then waits
    /// for every session to reach a terminal state.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        self.logger
            .log(&NO_PEER, &format!("SMTP Relay server running on {}", local_addr))
            .await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        let this = self.clone();
                        self.sessions.spawn(async move {
                            if let Err(e) = this.handle_client(stream, client_addr).await {
                                this.logger.error(&client_addr, &format!("Error: {:#}", e)).await;
                            }
                        });
                    }
                    Err(e) => {
                        self.logger
                            .error(&NO_PEER, &format!("Accept error on {}: {}", local_addr, e))
                            .await;
                    }
                }
            }
        }

        drop(listener);
        self.sessions.close();
        self.logger
            .log(
                &NO_PEER,
                &format!("Stopped accepting; waiting for {} session(s)", self.sessions.len()),
            )
            .await;
        self.sessions.wait().await;
        self.logger.log(&NO_PEER, "Server closed.").await;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, address: String, port: u16) -> Result<()> {
        let addr = format!("{}:{}", address, port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        self.serve(listener).await
    }
}

/// Reads one LF-terminated line holding at most `limit` bytes. A longer
/// line is skipped up to its LF and reported as `TooLong`; a final line
/// without LF before EOF is returned as is.
async fn read_line_limited<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let read = AsyncReadExt::take(&mut *reader, limit as u64)
        .read_until(b'\n', line)
        .await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if line.ends_with(b"\n") || read < limit {
        return Ok(LineRead::Line);
    }

    let mut scratch = Vec::with_capacity(DISCARD_CHUNK);
    loop {
        scratch.clear();
        let skipped = AsyncReadExt::take(&mut *reader, DISCARD_CHUNK as u64)
            .read_until(b'\n', &mut scratch)
            .await?;
        if skipped < DISCARD_CHUNK || scratch.ends_with(b"\n") {
            return Ok(LineRead::TooLong);
        }
    }
}

/// Splits `FROM:<a@b> SIZE=10` into the path and the trailing parameters.
fn envelope_argument<'a>(param: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    if !param
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    {
        return None;
    }
    let rest = param.get(prefix.len()..)?.trim_start();

    if let Some(rest) = rest.strip_prefix('<') {
        let (path, params) = rest.split_once('>')?;
        Some((path.trim().to_string(), params.trim()))
    } else {
        let (path, params) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if path.is_empty() {
            return None;
        }
        Some((path.to_string(), params.trim()))
    }
}

fn declared_size(params: &str) -> Option<usize> {
    params.split_whitespace().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_argument() {
        assert_eq!(
            envelope_argument("FROM:<a@example.com>", "FROM:"),
            Some(("a@example.com".to_string(), ""))
        );
        assert_eq!(
            envelope_argument("from: <a@example.com> SIZE=42 BODY=8BITMIME", "FROM:"),
            Some(("a@example.com".to_string(), "SIZE=42 BODY=8BITMIME"))
        );
        assert_eq!(
            envelope_argument("FROM:<>", "FROM:"),
            Some((String::new(), ""))
        );
        assert_eq!(
            envelope_argument("TO:b@example.com", "TO:"),
            Some(("b@example.com".to_string(), ""))
        );
        assert_eq!(envelope_argument("TO:<b@example.com", "TO:"), None);
        assert_eq!(envelope_argument("FROM:", "FROM:"), None);
        assert_eq!(envelope_argument("b@example.com", "TO:"), None);
        assert_eq!(envelope_argument("FROM\u{e9}", "FROM:"), None);
        assert_eq!(envelope_argument("T\u{e9}", "TO:"), None);
    }

    #[tokio::test]
    async fn test_read_line_limited() {
        let mut input: &[u8] = b"NOOP\r\nAAAAAAAAAAAAAAAAAAAA\r\nQUIT";
        let mut line = Vec::new();

        assert_eq!(read_line_limited(&mut input, &mut line, 8).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"NOOP\r\n");

        line.clear();
        assert_eq!(read_line_limited(&mut input, &mut line, 8).await.unwrap(), LineRead::TooLong);

        line.clear();
        assert_eq!(read_line_limited(&mut input, &mut line, 8).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"QUIT");

        line.clear();
        assert_eq!(read_line_limited(&mut input, &mut line, 8).await.unwrap(), LineRead::Eof);
    }

    #[test]
    fn test_declared_size() {
        assert_eq!(declared_size("SIZE=1024 BODY=8BITMIME"), Some(1024));
        assert_eq!(declared_size("size=7"), Some(7));
        assert_eq!(declared_size("BODY=8BITMIME"), None);
        assert_eq!(declared_size(""), None);
    }
}
