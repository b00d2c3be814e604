//! Turns the raw DATA of one transaction into a structured message

use std::fmt;

use mail_parser::{Address, Message, MessageParser, MimeHeaders, PartType};

use crate::error::RelayError;

const DEFAULT_ATTACHMENT_NAME: &str = "attachment";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One addressee taken from a `To` or `Cc` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: Option<String>,
    pub address: String,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub to: Vec<Recipient>,
    pub cc: Vec<Recipient>,
    pub attachments: Vec<Attachment>,
}

impl ParsedMessage {
    /// Rejects messages the mail API cannot address.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.to.is_empty() {
            return Err(RelayError::ValidationFailure("to"));
        }
        Ok(())
    }

    pub fn recipient_list(&self) -> String {
        self.to
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Parses a complete message. Fails on input that is not an RFC 5322
/// message or whose multipart structure is cut short.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage, RelayError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(RelayError::ParseFailure("empty message".to_string()));
    }

    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| RelayError::ParseFailure("not an RFC 5322 message".to_string()))?;

    if message.headers().is_empty() {
        return Err(RelayError::ParseFailure("message has no headers".to_string()));
    }

    check_multipart_closed(&message, raw)?;

    Ok(ParsedMessage {
        subject: message.subject().map(str::to_string),
        text: message.text_bodies().find_map(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        }),
        html: message.html_bodies().find_map(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        }),
        to: recipients(message.to()),
        cc: recipients(message.cc()),
        attachments: message
            .attachments()
            .map(|part| Attachment {
                filename: part
                    .attachment_name()
                    .unwrap_or(DEFAULT_ATTACHMENT_NAME)
                    .to_string(),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                content: part.contents().to_vec(),
            })
            .collect(),
    })
}

/// Runs [`parse`] off the protocol task.
pub async fn parse_async(raw: Vec<u8>) -> Result<ParsedMessage, RelayError> {
    tokio::task::spawn_blocking(move || parse(&raw))
        .await
        .map_err(|e| RelayError::ParseFailure(format!("parser task failed: {}", e)))?
}

/// Single-address and list forms both flatten to header order; group
/// members are inlined and entries without an address are dropped.
fn recipients(header: Option<&Address<'_>>) -> Vec<Recipient> {
    header
        .map(|address| {
            address
                .iter()
                .filter_map(|addr| {
                    let address = addr.address()?.trim();
                    if address.is_empty() {
                        return None;
                    }
                    Some(Recipient {
                        name: addr
                            .name()
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .map(str::to_string),
                        address: address.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn check_multipart_closed(message: &Message<'_>, raw: &[u8]) -> Result<(), RelayError> {
    for part in &message.parts {
        let Some(content_type) = part.content_type() else {
            continue;
        };
        if !content_type.ctype().eq_ignore_ascii_case("multipart") {
            continue;
        }
        let Some(boundary) = content_type.attribute("boundary") else {
            continue;
        };

        let delimiter = format!("--{}--", boundary);
        if !contains(raw, delimiter.as_bytes()) {
            return Err(RelayError::ParseFailure(format!(
                "multipart boundary {:?} is never closed",
                boundary
            )));
        }
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = "From: Sender <sender@example.org>\r\n\
To: Alice <alice@example.com>, bob@example.com\r\n\
Subject: Quarterly report\r\n\
\r\n\
Numbers are in.\r\n";

    const MULTIPART: &str = "From: sender@example.org\r\n\
To: alice@example.com\r\n\
Cc: Carol <carol@example.com>\r\n\
Subject: With attachment\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Plain body\r\n\
--inner\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>HTML body</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--outer--\r\n";

    #[test]
    fn test_parse_plain_message() {
        let message = parse(PLAIN.as_bytes()).unwrap();
        assert_eq!(message.subject.as_deref(), Some("Quarterly report"));
        assert!(message.text.as_deref().unwrap().contains("Numbers are in."));
        assert!(message.html.is_none());
        assert!(message.attachments.is_empty());
        assert_eq!(
            message.to,
            vec![
                Recipient {
                    name: Some("Alice".to_string()),
                    address: "alice@example.com".to_string(),
                },
                Recipient {
                    name: None,
                    address: "bob@example.com".to_string(),
                },
            ]
        );
        assert_eq!(
            message.recipient_list(),
            "Alice <alice@example.com>, bob@example.com"
        );
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_parse_multipart_message() {
        let message = parse(MULTIPART.as_bytes()).unwrap();
        assert!(message.text.as_deref().unwrap().contains("Plain body"));
        assert!(message.html.as_deref().unwrap().contains("<p>HTML body</p>"));
        assert_eq!(message.to.len(), 1);
        assert_eq!(message.cc[0].to_string(), "Carol <carol@example.com>");

        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.filename, "report.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.content, b"%PDF-1.4\n");
    }

    #[test]
    fn test_truncated_multipart_fails() {
        let cut = MULTIPART.find("--outer--").unwrap();
        let err = parse(MULTIPART[..cut].as_bytes()).unwrap_err();
        assert!(matches!(err, RelayError::ParseFailure(_)));
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(matches!(parse(b""), Err(RelayError::ParseFailure(_))));
        assert!(matches!(parse(b"\r\n\r\n"), Err(RelayError::ParseFailure(_))));
    }

    #[test]
    fn test_missing_recipients_fail_validation() {
        let raw = "From: sender@example.org\r\nSubject: nobody\r\n\r\nHello\r\n";
        let message = parse(raw.as_bytes()).unwrap();
        assert!(message.to.is_empty());
        assert!(matches!(
            message.validate(),
            Err(RelayError::ValidationFailure("to"))
        ));

        let raw = "From: sender@example.org\r\nTo: undisclosed-recipients:;\r\n\r\nHello\r\n";
        let message = parse(raw.as_bytes()).unwrap();
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_group_recipients_are_flattened() {
        let raw = "From: sender@example.org\r\n\
To: Team: ann@example.com, Ben <ben@example.com>;\r\n\
\r\n\
Hi\r\n";
        let message = parse(raw.as_bytes()).unwrap();
        let addresses: Vec<_> = message.to.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, ["ann@example.com", "ben@example.com"]);
    }

    #[tokio::test]
    async fn test_parse_async() {
        let message = parse_async(PLAIN.as_bytes().to_vec()).await.unwrap();
        assert_eq!(message.to.len(), 2);
    }
}
