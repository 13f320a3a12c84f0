use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use url::Url;

/// Client for the transactional mail API.
#[derive(Clone)]
pub struct MailClient {
    http: Client,
    base_url: Url,
    api_key: String,
    from: String,
}

impl MailClient {
    /// Creates a new mail client. `from` is the sender address stamped on
    /// every outbound message.
    pub fn new(
        api_key: impl Into<String>,
        base_url: Url,
        from: impl Into<String>,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Sends a single HTML email.
    pub async fn send(&self, message: &OutboundEmail<'_>) -> Result<(), MailError> {
        let url = self.base_url.join("emails")?;
        let body = serde_json::json!({
            "from": self.from,
            "to": [message.to],
            "subject": message.subject,
            "html": message.html,
        });

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        ensure_success(response).await
    }
}

/// One outbound email.
pub struct OutboundEmail<'a> {
    pub to: &'a str,
    pub subject: &'a str,
    pub html: &'a str,
}

/// Errors produced by the mail client.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<(), MailError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MailError::Status { status, body });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> MailClient {
        MailClient::new(
            "mail-key",
            base_url.clone(),
            "Question Bank <no-reply@example.com>",
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn send_posts_expected_body() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v1/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/emails")
                    .header("Authorization", "Bearer mail-key")
                    .json_body(json!({
                        "from": "Question Bank <no-reply@example.com>",
                        "to": ["a@b.com"],
                        "subject": "Welcome",
                        "html": "<p>hi</p>"
                    }));
                then.status(200).json_body(json!({ "id": "email-1" }));
            })
            .await;

        client
            .send(&OutboundEmail {
                to: "a@b.com",
                subject: "Welcome",
                html: "<p>hi</p>",
            })
            .await
            .expect("send");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_returns_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v1/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/emails");
                then.status(422).body("invalid recipient");
            })
            .await;

        let err = client
            .send(&OutboundEmail {
                to: "bad",
                subject: "Welcome",
                html: "<p>hi</p>",
            })
            .await
            .expect_err("should error");
        match err {
            MailError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "invalid recipient");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
