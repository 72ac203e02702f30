//! Transport settings handed to the connector (proxy selection).

use serde::{Deserialize, Serialize};
use url::Url;

use outreach_core::{DomainError, DomainResult};

/// Proxy protocols the connector can dial through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

/// A validated proxy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// How to reach the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `http://`, `https://` or `socks5://` proxy; direct connection when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl TransportConfig {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn with_proxy(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: Some(proxy_url.into()),
        }
    }

    /// Parse the proxy URL, if any. Blank strings mean "no proxy".
    pub fn proxy(&self) -> DomainResult<Option<ProxyEndpoint>> {
        let raw = match self.proxy_url.as_deref().map(str::trim) {
            None | Some("") => return Ok(None),
            Some(raw) => raw,
        };

        let url = Url::parse(raw)
            .map_err(|e| DomainError::validation(format!("invalid proxy URL: {e}")))?;

        let scheme = match url.scheme() {
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            "socks5" => ProxyScheme::Socks5,
            other => {
                return Err(DomainError::validation(format!(
                    "unsupported proxy type: {other} (use http, https, or socks5)"
                )));
            }
        };

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(DomainError::validation("proxy host is required")),
        };

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        Ok(Some(ProxyEndpoint {
            scheme,
            host,
            port: url.port(),
            username,
            password: url.password().map(str::to_string),
        }))
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.proxy().map(|_| ())
    }
}
