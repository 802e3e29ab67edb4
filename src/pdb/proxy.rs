use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// How outbound requests reach the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    /// Direct connection; `acquire` always yields `None`.
    Disabled,
    /// Ask a proxy-pool service for a fresh `host:port` before every request.
    Pool { url: String },
}

/// Single-use egress assignment for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    addr: String,
}

impl ProxyLease {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Pool entries are bare `host:port`; they are plain HTTP proxies for both schemes.
    pub fn proxy_url(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("http://{}", self.addr)
        }
    }
}

#[derive(Debug, Deserialize)]
struct PoolResponse {
    proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyProvider {
    mode: ProxyMode,
    http: Client,
}

impl ProxyProvider {
    pub fn new(mode: ProxyMode, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent("profile-harvest/0.1 (proxy-pool)")
            .timeout(timeout)
            .build()?;
        Ok(Self { mode, http })
    }

    pub fn disabled() -> Self {
        Self {
            mode: ProxyMode::Disabled,
            http: Client::new(),
        }
    }

    pub fn mode(&self) -> &ProxyMode {
        &self.mode
    }

    /// Never errors: every pool problem is logged and reported as "no lease".
    pub async fn acquire(&self) -> Option<ProxyLease> {
        let url = match &self.mode {
            ProxyMode::Disabled => return None,
            ProxyMode::Pool { url } => url,
        };

        let resp = match self.http.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "proxy pool request failed");
                return None;
            }
        };
        if resp.status() != StatusCode::OK {
            warn!(status = resp.status().as_u16(), "proxy pool returned non-200");
            return None;
        }
        let lease = match resp.json::<PoolResponse>().await {
            Ok(body) => parse_lease(body),
            Err(err) => {
                warn!(error = %err, "proxy pool response was not valid JSON");
                return None;
            }
        };
        match &lease {
            Some(lease) => debug!(proxy = lease.addr(), "acquired proxy lease"),
            None => warn!("proxy pool response carried no proxy"),
        }
        lease
    }
}

fn parse_lease(body: PoolResponse) -> Option<ProxyLease> {
    body.proxy
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(ProxyLease::new)
}
