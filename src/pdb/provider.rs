use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::proxy::{ProxyLease, ProxyProvider};
use crate::error::FetchError;

const USER_AGENT: &str = "profile-harvest/0.1";

/// One GET returning a JSON document. The pipeline only talks to the network
/// through this seam, so tests can script responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError>;
}

/// Throttled reqwest fetcher.
///
/// The delay is slept by the calling task before every request, so `W`
/// concurrent workers produce up to `W` requests per delay window.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    direct: Client,
    proxies: ProxyProvider,
    proxy_required: bool,
    delay: Duration,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        proxies: ProxyProvider,
        proxy_required: bool,
        delay: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let direct = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            direct,
            proxies,
            proxy_required,
            delay,
            timeout,
        })
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn leased_client(&self, lease: &ProxyLease, url: &str) -> Result<Client, FetchError> {
        let proxy = reqwest::Proxy::all(lease.proxy_url())
            .map_err(|e| FetchError::transport(url, format!("invalid proxy lease {}: {e}", lease.addr())))?;
        Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| FetchError::transport(url, e))
    }

    async fn client_for(&self, url: &str) -> Result<Client, FetchError> {
        match self.proxies.acquire().await {
            Some(lease) => self.leased_client(&lease, url),
            None if self.proxy_required => Err(FetchError::ProxyUnavailable {
                url: url.to_string(),
            }),
            None => Ok(self.direct.clone()),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        let client = self.client_for(url).await?;

        debug!(url, "GET");
        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        let status = resp.status();
        if status != StatusCode::OK {
            warn!(url, status = status.as_u16(), "remote rejected request");
            return Err(FetchError::RemoteRejected {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        resp.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Decode {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            } else {
                FetchError::transport(url, e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdb::proxy::{ProxyMode, ProxyProvider};

    #[tokio::test]
    async fn required_proxy_without_lease_never_goes_direct() {
        // Pool URL on a closed port: acquire() fails and yields no lease.
        let proxies = ProxyProvider::new(
            ProxyMode::Pool {
                url: "http://127.0.0.1:9/next".into(),
            },
            Duration::from_millis(200),
        )
        .unwrap();
        let fetcher =
            HttpFetcher::new(proxies, true, Duration::ZERO, Duration::from_millis(200)).unwrap();

        let err = fetcher
            .get_json("http://127.0.0.1:9/profile/1")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ProxyUnavailable { .. }));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_failure() {
        let fetcher = HttpFetcher::new(
            ProxyProvider::disabled(),
            false,
            Duration::ZERO,
            Duration::from_millis(200),
        )
        .unwrap();

        let err = fetcher
            .get_json("http://127.0.0.1:9/profile/1")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
    }
}
