use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

/// Launch flags passed to the browser whether or not a proxy is in use.
pub const DEFAULT_DRIVER_ARGS: [&str; 2] = ["--no-sandbox", "--disable-setuid-sandbox"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid proxy URL: {0}")]
    InvalidUrl(String),
    #[error("Failed to read proxy settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse proxy settings: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    None,
    Single,
    Rotating,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub mode: ProxyMode,
    #[serde(default)]
    pub proxies: Vec<String>,
}

impl ProxySettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Loads settings from `path`. A missing file disables proxying, and so
    /// does a file that cannot be read or parsed (after logging why).
    pub fn load<P: AsRef<Path>>(path: P) -> Option<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No proxy settings at {:?}, proxying disabled", path);
            return None;
        }

        match Self::from_file(path) {
            Ok(settings) => Some(settings),
            Err(e) => {
                error!("Failed to load proxy settings from {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != ProxyMode::None && !self.proxies.is_empty()
    }

    /// Picks the endpoint the browser is launched with for this run.
    pub fn select(&self) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }

        match self.mode {
            ProxyMode::None => None,
            ProxyMode::Single => self.proxies.first().cloned(),
            // The browser is launched once per run, so a run only ever sees
            // the first endpoint of the rotation.
            ProxyMode::Rotating => {
                let selected = ProxyRotator::new(self.proxies.clone())
                    .next_proxy()
                    .map(str::to_string);
                debug!(
                    "Rotating mode: using {:?} of {} proxies for this run",
                    selected,
                    self.proxies.len()
                );
                selected
            }
        }
    }
}

/// Round-robin cursor over a fixed list of proxy endpoints.
#[derive(Debug, Clone, Default)]
pub struct ProxyRotator {
    proxies: Vec<String>,
    cursor: usize,
}

impl ProxyRotator {
    pub fn new(proxies: Vec<String>) -> Self {
        Self { proxies, cursor: 0 }
    }

    pub fn next_proxy(&mut self) -> Option<&str> {
        if self.proxies.is_empty() {
            return None;
        }
        let current = self.cursor;
        self.cursor = (self.cursor + 1) % self.proxies.len();
        Some(self.proxies[current].as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    /// `user:pass` form.
    pub fn as_credentials(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub proxy_type: String,
    pub host_port: String,
    pub auth: Option<ProxyAuth>,
}

/// `Url` keeps userinfo percent-encoded; the browser needs the raw text.
fn decode_userinfo(raw: &str) -> Result<String, ProxyError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ProxyError::InvalidUrl(format!("credentials are not UTF-8: {}", e)))
}

impl ProxyEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(endpoint).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUrl(format!("{} has no host", endpoint)))?;

        let host_port = match url.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let auth = if url.username().is_empty() {
            None
        } else {
            Some(ProxyAuth {
                username: decode_userinfo(url.username())?,
                password: decode_userinfo(url.password().unwrap_or_default())?,
            })
        };

        Ok(Self {
            proxy_type: url.scheme().to_string(),
            host_port,
            auth,
        })
    }

    /// Value for chrome's `--proxy-server` flag.
    pub fn server(&self) -> String {
        format!("{}://{}", self.proxy_type, self.host_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverArgs {
    pub args: Vec<String>,
    pub proxy: Option<ProxyEndpoint>,
}

impl DriverArgs {
    pub fn proxy_auth(&self) -> Option<&ProxyAuth> {
        self.proxy.as_ref().and_then(|p| p.auth.as_ref())
    }
}

impl Default for DriverArgs {
    fn default() -> Self {
        Self {
            args: DEFAULT_DRIVER_ARGS.iter().map(|a| a.to_string()).collect(),
            proxy: None,
        }
    }
}

/// Derives browser launch arguments for an optional proxy endpoint.
///
/// Credentials are kept out of `args`; they surface through
/// [`DriverArgs::proxy_auth`] and are answered per page.
pub fn build_driver_args(endpoint: Option<&str>) -> DriverArgs {
    let mut driver_args = DriverArgs::default();

    let Some(endpoint) = endpoint else {
        return driver_args;
    };

    match ProxyEndpoint::parse(endpoint) {
        Ok(proxy) => {
            info!("Using proxy {} ({})", proxy.host_port, proxy.proxy_type);
            driver_args
                .args
                .push(format!("--proxy-server={}", proxy.server()));
            driver_args.proxy = Some(proxy);
        }
        Err(e) => {
            warn!("Ignoring proxy settings: {}", e);
        }
    }

    driver_args
}
