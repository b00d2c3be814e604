//! # smtp-graph-relay
//!
//! Accepts mail over plain SMTP and forwards every message through the
//! Microsoft Graph `sendMail` API, sending as one configured mailbox.
//!
//! Each connection is checked against an allow-list of addresses and CIDR
//! ranges, then runs an independent SMTP session. The DATA of a transaction
//! is parsed as MIME; subject, bodies, `To`/`Cc` recipients and attachments
//! are mapped onto a single API call. Forwarding is synchronous: the peer
//! gets `250` only after the API accepted the message, and a transient
//! failure otherwise. Nothing is queued or retried.
//!
//! The envelope (`MAIL FROM`/`RCPT TO`) is accepted but ignored; recipients
//! come from the message headers.

pub mod access;
pub mod config;
pub mod error;
pub mod forward;
pub mod graph;
pub mod message;
pub mod relay;
pub mod session;
pub mod tls;
pub mod utils;

pub use access::{permit, AllowList, IpMask};
pub use config::RelayConfig;
pub use error::{ForwardError, RelayError};
pub use forward::{resolve_identity, BodyType, Forwarder, MailApi, OutboundMailRequest};
pub use graph::{GraphClient, GraphCredentials};
pub use message::{Attachment, ParsedMessage, Recipient};
pub use relay::SmtpRelay;
pub use session::{SessionState, SmtpSession};
pub use utils::Logger;
