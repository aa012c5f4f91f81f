//! Accounts and the pluggable authentication service.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A user of the cluster. Accounts exist implicitly; usage counters
/// accumulate as their jobs complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub admin: bool,

    /// Cumulative runtime of this account's completed jobs, in nanoseconds.
    #[serde(default)]
    pub total_runtime: i64,
    /// Number of jobs completed on behalf of this account.
    #[serde(default)]
    pub total_jobs: i64,
}

impl Account {
    pub fn named(name: &str) -> Self {
        Account {
            name: name.to_string(),
            ..Account::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0} from auth service")]
    UnexpectedStatus(u16),
}

/// Services that an authentication backend may supply.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Whether the API key is valid for the named account.
    async fn validate(&self, account: &str, key: &str) -> Result<bool, AuthError>;

    /// A hint to API consumers about what other calls this backend supports.
    fn style(&self) -> &str;
}

/// Rejects every account. The default when no auth service is configured,
/// and a useful embed for test cases.
pub struct DenyAllAuthService;

#[async_trait]
impl AuthService for DenyAllAuthService {
    async fn validate(&self, _account: &str, _key: &str) -> Result<bool, AuthError> {
        Ok(false)
    }

    fn style(&self) -> &str {
        "null"
    }
}

/// An authentication backend reached over HTTPS.
pub struct RemoteAuthService {
    client: reqwest::Client,
    reported_style: String,
    validate_url: String,
}

#[async_trait]
impl AuthService for RemoteAuthService {
    async fn validate(&self, account: &str, key: &str) -> Result<bool, AuthError> {
        let response = self
            .client
            .get(&self.validate_url)
            .query(&[("accountName", account), ("apiKey", key)])
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(
                    status = status.as_u16(),
                    body = %body,
                    "authentication service returned an unexpected response"
                );
                Err(AuthError::UnexpectedStatus(status.as_u16()))
            }
        }
    }

    fn style(&self) -> &str {
        &self.reported_style
    }
}

/// Initialize an authentication service for a (possibly empty) address.
///
/// The remote backend reports its capability style in the body of a GET
/// against its base URL; that string is fetched once here.
pub async fn connect_to_auth_service(
    address: &str,
    client: reqwest::Client,
) -> Result<Box<dyn AuthService>, AuthError> {
    if address.is_empty() {
        return Ok(Box::new(DenyAllAuthService));
    }

    if !address.starts_with("https://") {
        tracing::warn!(address, "non-HTTPS address in use for authentication");
    }

    let base = if address.ends_with('/') {
        address.to_string()
    } else {
        format!("{}/", address)
    };

    let response = client.get(&base).send().await?;
    let reported_style = response.text().await?.trim().to_string();

    Ok(Box::new(RemoteAuthService {
        client,
        reported_style,
        validate_url: format!("{}validate", base),
    }))
}

/// Extract an account name and API key from an HTTP basic auth header value.
pub fn basic_credentials(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, key) = decoded.split_once(':')?;
    Some((name.to_string(), key.to_string()))
}
