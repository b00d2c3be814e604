//! Maps a parsed message onto a single `sendMail` call

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Serialize;

use crate::error::ForwardError;
use crate::message::{ParsedMessage, Recipient};

pub const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";

/// The "send mail as user" capability of the mail API.
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn send_mail(&self, request: &OutboundMailRequest) -> Result<(), ForwardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BodyType {
    #[serde(rename = "HTML")]
    Html,
    #[serde(rename = "Text")]
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    pub content_type: BodyType,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecipient {
    pub email_address: EmailAddress,
}

impl From<&Recipient> for ApiRecipient {
    fn from(recipient: &Recipient) -> Self {
        ApiRecipient {
            email_address: EmailAddress {
                address: recipient.address.clone(),
                name: recipient.name.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    #[serde(rename = "@odata.type")]
    pub odata_type: &'static str,
    pub name: String,
    pub content_type: String,
    pub content_bytes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: ItemBody,
    pub to_recipients: Vec<ApiRecipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc_recipients: Vec<ApiRecipient>,
    pub attachments: Vec<FileAttachment>,
}

/// Request body of `POST /users/{send_as}/sendMail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMailRequest {
    #[serde(skip)]
    pub send_as: String,
    pub message: OutboundMessage,
    pub save_to_sent_items: bool,
}

/// Extracts `addr` from `Display Name <addr>`; anything else is used as is.
pub fn resolve_identity(identity: &str) -> &str {
    let identity = identity.trim();
    if let Some((_, rest)) = identity.rsplit_once('<') {
        if let Some((address, _)) = rest.split_once('>') {
            let address = address.trim();
            if !address.is_empty() {
                return address;
            }
        }
    }
    identity
}

pub fn build_request(
    message: &ParsedMessage,
    send_as: &str,
    save_to_sent_items: bool,
) -> OutboundMailRequest {
    let body = match &message.html {
        Some(html) => ItemBody {
            content_type: BodyType::Html,
            content: html.clone(),
        },
        None => ItemBody {
            content_type: BodyType::Text,
            content: message.text.clone().unwrap_or_default(),
        },
    };

    OutboundMailRequest {
        send_as: send_as.to_string(),
        message: OutboundMessage {
            subject: message.subject.clone(),
            body,
            to_recipients: message.to.iter().map(ApiRecipient::from).collect(),
            cc_recipients: message.cc.iter().map(ApiRecipient::from).collect(),
            attachments: message
                .attachments
                .iter()
                .map(|attachment| FileAttachment {
                    odata_type: FILE_ATTACHMENT_TYPE,
                    name: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    content_bytes: B64.encode(&attachment.content),
                })
                .collect(),
        },
        save_to_sent_items,
    }
}

/// Sends parsed messages on behalf of the configured identity.
#[derive(Clone)]
pub struct Forwarder {
    api: Arc<dyn MailApi>,
    identity: String,
    save_to_sent_items: bool,
}

impl Forwarder {
    pub fn new(api: Arc<dyn MailApi>, configured_identity: &str, save_to_sent_items: bool) -> Self {
        Self {
            api,
            identity: resolve_identity(configured_identity).to_string(),
            save_to_sent_items,
        }
    }

    /// The bare mailbox address messages are sent as.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Issues exactly one API call. Failures are returned, never retried.
    pub async fn forward(&self, message: &ParsedMessage) -> Result<(), ForwardError> {
        let request = build_request(message, &self.identity, self.save_to_sent_items);
        self.api.send_mail(&request).await
    }
}
