use std::{future::Future, pin::Pin, time::Duration};

use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

use crate::domain::DesiredAccount;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of desired account records.
pub trait DesiredStateFetcher: Send + Sync {
    /// `Ok(None)` means the store has no record for `username`.
    fn get<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<DesiredAccount>, FetchError>>;
}

#[derive(Debug)]
pub enum FetchError {
    Client(reqwest::Error),
    Http { key: String, source: reqwest::Error },
    Status { key: String, status: u16, body: String },
    Decode { key: String, details: String },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(e) => write!(f, "build store client: {e}"),
            Self::Http { key, source } => write!(f, "store request for {key} failed: {source}"),
            Self::Status { key, status, body } => {
                write!(f, "store request for {key} failed: {status}: {body}")
            }
            Self::Decode { key, details } => write!(f, "decode record {key}: {details}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Client(e) => Some(e),
            Self::Http { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsulSettings {
    pub http_addr: String,
    pub token: Option<String>,
    pub user_key_prefix: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Reads `<prefix>/<username>` from the Consul KV HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulKvFetcher {
    base: String,
    token: Option<String>,
    prefix: String,
    client: reqwest::Client,
}

impl ConsulKvFetcher {
    pub fn new(settings: &ConsulSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kvusers/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            base: settings.http_addr.trim_end_matches('/').to_string(),
            token: settings.token.clone().filter(|t| !t.is_empty()),
            prefix: settings.user_key_prefix.trim_matches('/').to_string(),
            client,
        })
    }

    fn key_for(&self, username: &str) -> String {
        if self.prefix.is_empty() {
            username.to_string()
        } else {
            format!("{}/{username}", self.prefix)
        }
    }

    async fn fetch(&self, username: &str) -> Result<Option<DesiredAccount>, FetchError> {
        let key = self.key_for(username);
        let url = format!("{}/v1/kv/{key}", self.base);

        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        let resp = req.send().await.map_err(|source| FetchError::Http {
            key: key.clone(),
            source,
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(key = %key, "no record in store");
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status { key, status, body });
        }

        let pairs = resp
            .json::<Vec<KvPair>>()
            .await
            .map_err(|e| FetchError::Decode {
                key: key.clone(),
                details: e.to_string(),
            })?;
        let Some(encoded) = pairs.into_iter().next().and_then(|p| p.value) else {
            debug!(key = %key, "record has no value");
            return Ok(None);
        };

        let account = decode_account(&encoded).map_err(|details| FetchError::Decode {
            key: key.clone(),
            details,
        })?;
        Ok(Some(fill_username(account, username)))
    }
}

impl DesiredStateFetcher for ConsulKvFetcher {
    fn get<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<DesiredAccount>, FetchError>> {
        Box::pin(self.fetch(username))
    }
}

fn decode_account(encoded: &str) -> Result<DesiredAccount, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("base64: {e}"))?;
    serde_json::from_slice::<DesiredAccount>(&bytes).map_err(|e| format!("json: {e}"))
}

fn fill_username(mut account: DesiredAccount, requested: &str) -> DesiredAccount {
    if account.username.is_empty() {
        account.username = requested.to_string();
    }
    account
}
