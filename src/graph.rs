//! Microsoft Graph implementation of [`MailApi`]

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::ForwardError;
use crate::forward::{MailApi, OutboundMailRequest};

const AUTHORITY: &str = "https://login.microsoftonline.com";
const GRAPH_ENDPOINT: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct GraphClient {
    http: reqwest::Client,
    credentials: GraphCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    pub fn new(credentials: GraphCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            token: Mutex::new(None),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", AUTHORITY, self.credentials.tenant_id)
    }

    async fn access_token(&self) -> Result<String, ForwardError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| ForwardError::Authentication(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Authentication(format!(
                "token endpoint returned HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ForwardError::Authentication(format!("malformed token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

/// `send_as` is pushed as a single, percent-encoded path segment.
pub fn send_mail_url(send_as: &str) -> Result<reqwest::Url, ForwardError> {
    let mut url =
        reqwest::Url::parse(GRAPH_ENDPOINT).map_err(|e| ForwardError::Endpoint(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ForwardError::Endpoint(GRAPH_ENDPOINT.to_string()))?
        .extend(["users", send_as, "sendMail"]);
    Ok(url)
}

#[async_trait]
impl MailApi for GraphClient {
    async fn send_mail(&self, request: &OutboundMailRequest) -> Result<(), ForwardError> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(send_mail_url(&request.send_as)?)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.token.lock().await.take();
        }

        Err(ForwardError::Rejected {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = GraphClient::new(GraphCredentials {
            tenant_id: "contoso-tenant".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
        });
        assert_eq!(
            client.token_url(),
            "https://login.microsoftonline.com/contoso-tenant/oauth2/v2.0/token"
        );
        assert_eq!(
            send_mail_url("relay@example.com").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/users/relay@example.com/sendMail"
        );
    }

    #[test]
    fn test_send_mail_url_encodes_identity() {
        let url = send_mail_url("ops/team#1?x@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://graph.microsoft.com/v1.0/users/ops%2Fteam%231%3Fx@example.com/sendMail"
        );
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[test]
    fn test_token_response_deserializes() {
        let token: TokenResponse = serde_json::from_str(
            r#"{"token_type":"Bearer","expires_in":3599,"ext_expires_in":3599,"access_token":"eyJ0"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "eyJ0");
        assert_eq!(token.expires_in, 3599);
    }
}
