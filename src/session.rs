use std::net::SocketAddr;

/// Lifecycle of one connection.
///
/// After `Completed` or `Failed` the session returns to `Admitted` and the
/// peer may start another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Rejected,
    Admitted,
    EnvelopeReceiving,
    DataReceiving,
    Completed,
    Failed,
}

/// Protocol state of one TCP connection.
///
/// The envelope is recorded for logging only; forwarding decisions use the
/// parsed message headers.
pub struct SmtpSession {
    pub client_addr: SocketAddr,
    pub state: SessionState,
    pub helo: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
    pub data_overflow: bool,
    pub tls_active: bool,
    /// Terminal state of the most recent transaction.
    pub last_outcome: Option<SessionState>,
}

impl SmtpSession {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            state: SessionState::Connecting,
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            data: Vec::new(),
            data_overflow: false,
            tls_active: false,
            last_outcome: None,
        }
    }

    pub fn admit(&mut self) {
        self.state = SessionState::Admitted;
    }

    pub fn reject(&mut self) {
        self.state = SessionState::Rejected;
    }

    pub fn begin_envelope(&mut self, from: String) {
        self.reset();
        self.mail_from = Some(from);
        self.state = SessionState::EnvelopeReceiving;
    }

    pub fn add_recipient(&mut self, to: String) {
        self.rcpt_to.push(to);
    }

    pub fn begin_data(&mut self) {
        self.data.clear();
        self.data_overflow = false;
        self.state = SessionState::DataReceiving;
    }

    /// Appends one unstuffed data line, or marks the transaction oversized.
    pub fn push_data(&mut self, line: &[u8], max_size: usize) {
        if self.data_overflow {
            return;
        }
        if self.data.len() + line.len() > max_size {
            self.mark_overflow();
        } else {
            self.data.extend_from_slice(line);
        }
    }

    /// Drops the buffered DATA; the transaction ends in a size error.
    pub fn mark_overflow(&mut self) {
        self.data_overflow = true;
        self.data = Vec::new();
    }

    /// Hands the accumulated bytes to the caller, leaving the buffer empty.
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn complete(&mut self) {
        self.state = SessionState::Completed;
        self.last_outcome = Some(SessionState::Completed);
    }

    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.last_outcome = Some(SessionState::Failed);
    }

    /// The state a finished connection is reported with.
    pub fn outcome(&self) -> SessionState {
        match self.state {
            SessionState::Rejected => SessionState::Rejected,
            _ => self.last_outcome.unwrap_or(self.state),
        }
    }

    pub fn in_transaction(&self) -> bool {
        matches!(
            self.state,
            SessionState::EnvelopeReceiving | SessionState::DataReceiving
        )
    }

    /// Clears the envelope and any buffered data, keeping HELO.
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.data = Vec::new();
        self.data_overflow = false;
        if self.state != SessionState::Rejected && self.state != SessionState::Connecting {
            self.state = SessionState::Admitted;
        }
    }

    /// Full reset after a STARTTLS handshake.
    pub fn reset_all(&mut self) {
        self.helo = None;
        self.reset();
    }
}
