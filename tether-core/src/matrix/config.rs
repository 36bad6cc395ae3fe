use std::time::Duration;

use reqwest::Url;

use crate::matrix::error::MatrixError;

/// How long the homeserver may hold a long-poll open.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
/// Transport timeout; must comfortably exceed the long-poll wait.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to talk to one homeserver before logging in.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub homeserver: Url,
    /// Skip TLS certificate validation. Development servers only.
    pub allow_insecure_connections: bool,
    pub request_timeout: Duration,
    pub sync_timeout: Duration,
}

impl ClientConfig {
    pub fn new(homeserver: &str) -> Result<Self, MatrixError> {
        Ok(Self {
            homeserver: parse_homeserver(homeserver)?,
            allow_insecure_connections: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        })
    }

    pub fn allow_insecure_connections(mut self, allow: bool) -> Self {
        self.allow_insecure_connections = allow;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

/// Accept `example.org`, `example.org:8448` or a full URL. Bare hosts get
/// `https://`; any path, query or fragment is dropped.
pub fn parse_homeserver(input: &str) -> Result<Url, MatrixError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MatrixError::InvalidHomeserver(input.to_owned()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let mut url =
        Url::parse(&with_scheme).map_err(|e| MatrixError::InvalidHomeserver(format!("{input}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(MatrixError::InvalidHomeserver(input.to_owned()));
    }

    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_defaults_to_https() {
        let url = parse_homeserver("matrix.example.org").unwrap();
        assert_eq!(url.as_str(), "https://matrix.example.org/");
    }

    #[test]
    fn keeps_scheme_and_port_and_drops_path() {
        let url = parse_homeserver(" http://localhost:8448/some/path?x=1 ").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.port(), Some(8448));
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), None);
    }

    #[test]
    fn rejects_empty_and_foreign_schemes() {
        assert!(matches!(
            parse_homeserver("   "),
            Err(MatrixError::InvalidHomeserver(_))
        ));
        assert!(matches!(
            parse_homeserver("ftp://example.org"),
            Err(MatrixError::InvalidHomeserver(_))
        ));
    }

    #[test]
    fn defaults_keep_request_timeout_above_long_poll() {
        let config = ClientConfig::new("example.org").unwrap();
        assert!(config.request_timeout > config.sync_timeout);
        assert!(!config.allow_insecure_connections);
    }
}
