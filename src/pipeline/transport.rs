use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::time::Duration;

pub trait Transport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("rtagg/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("GET {url} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("GET {url} returned status {}", response.status());
        }
        let body = response
            .bytes()
            .with_context(|| format!("failed to read body from {url}"))?;
        Ok(body.to_vec())
    }
}
