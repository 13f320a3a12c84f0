use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the identity directory that owns user accounts.
#[derive(Clone)]
pub struct IdentityClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl IdentityClient {
    /// Creates a new identity client with the provided configuration.
    pub fn new(api_key: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Looks up a user by email. Returns `None` when no account exists.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        let mut url = self.base_url.join("users")?;
        url.query_pairs_mut().append_pair("email", email);

        let response = self.authorized_request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        parse_json::<IdentityUser>(response).await.map(Some)
    }

    /// Creates a new student account for the given email.
    ///
    /// A concurrent creation for the same email surfaces as
    /// [`IdentityError::AlreadyExists`]; callers resolve it with a lookup.
    pub async fn create_student(&self, email: &str) -> Result<IdentityUser, IdentityError> {
        let url = self.base_url.join("users")?;
        let body = serde_json::json!({ "email": email, "role": "student" });

        let response = self
            .authorized_request(Method::POST, url)
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(IdentityError::AlreadyExists);
        }

        parse_json(response).await
    }

    /// Requests a single-use credential-setup link for the given email.
    pub async fn issue_setup_link(
        &self,
        email: &str,
        return_url: &str,
    ) -> Result<String, IdentityError> {
        let url = self.base_url.join("credential-links")?;
        let body = serde_json::json!({ "email": email, "return_url": return_url });

        let response = self
            .authorized_request(Method::POST, url)
            .json(&body)
            .send()
            .await?;

        parse_json::<SetupLinkResponse>(response)
            .await
            .map(|link| link.url)
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

/// Directory record for a single user.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IdentityUser {
    pub uid: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SetupLinkResponse {
    url: String,
}

/// Errors produced by the identity client.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("account already exists for this email")]
    AlreadyExists,
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, IdentityError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(IdentityError::Status { status, body });
    }

    Ok(response.json().await?)
}
