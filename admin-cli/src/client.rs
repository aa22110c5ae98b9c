//! HTTP client for the provisioning API.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct ConnectOutput {
    pub connection_config: String,
    pub address: String,
}

#[derive(Deserialize)]
struct TokenOutput {
    one_time_token: String,
}

#[derive(Deserialize)]
struct ErrorOutput {
    error: String,
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Ask for a one-time token using the master token.
    pub async fn one_time_token(&self, master_token: &str) -> Result<String> {
        let url = format!("{}/token", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(master_token)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let output: TokenOutput = Self::parse(resp).await?;
        Ok(output.one_time_token)
    }

    /// Provision this node. `token` is a one-time token or the master token.
    pub async fn connect(
        &self,
        token: &str,
        name: Option<&str>,
        groups: Option<&str>,
        public_key_pem: &str,
    ) -> Result<ConnectOutput> {
        let url = format!("{}/connect", self.base_url);
        let mut query = vec![("public_key", public_key_pem)];
        if let Some(name) = name {
            query.push(("name", name));
        }
        if let Some(groups) = groups {
            query.push(("groups", groups));
        }

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        Self::parse(resp).await
    }

    async fn parse<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ErrorOutput>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| "no details".to_string());
            bail!("server returned {status}: {message}");
        }
        resp.json::<T>().await.context("decoding response body")
    }
}
