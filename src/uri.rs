use std::fmt;

use reqwest::Url;

use crate::error::SyncError;

/// Base URI of a remote server, normalized so the path always ends in `/`.
///
/// Two URIs are equal iff their normalized text is equal, which is what keys
/// sessions in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionUri(Url);

impl ConnectionUri {
    /// Parse and normalize a base URI.
    ///
    /// - Scheme must be `http` or `https`.
    /// - Must have a host.
    /// - Query and fragment are dropped.
    /// - A trailing `/` is appended if missing.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| SyncError::InvalidUri {
            uri: trimmed.to_string(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }

        url.set_query(None);
        url.set_fragment(None);
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Host name without port, used as the debugger attach host.
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Resolve a relative API path (no leading slash) against the base.
    pub fn join(&self, path: &str) -> Result<Url, SyncError> {
        self.0
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::InvalidUri {
                uri: format!("{}{}", self.0, path),
                reason: e.to_string(),
            })
    }

    /// WebSocket URL for a relative path: `http` becomes `ws`, `https` becomes `wss`.
    pub fn ws_url(&self, path: &str) -> Result<Url, SyncError> {
        let mut url = self.join(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| SyncError::InvalidUri {
            uri: url.to_string(),
            reason: format!("cannot switch scheme to {}", scheme),
        })?;
        Ok(url)
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl std::str::FromStr for ConnectionUri {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_trailing_slash() {
        let uri = ConnectionUri::parse("http://10.0.1.10:9090").unwrap();
        assert_eq!(uri.as_str(), "http://10.0.1.10:9090/");
    }

    #[test]
    fn keeps_existing_path_and_adds_slash() {
        let uri = ConnectionUri::parse("https://dev.example.com/remote").unwrap();
        assert_eq!(uri.as_str(), "https://dev.example.com/remote/");
    }

    #[test]
    fn equal_after_normalization() {
        let a = ConnectionUri::parse("http://host:9090").unwrap();
        let b = ConnectionUri::parse("  http://host:9090/  ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn drops_query_and_fragment() {
        let uri = ConnectionUri::parse("http://host:9090/?a=b#frag").unwrap();
        assert_eq!(uri.as_str(), "http://host:9090/");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(matches!(
            ConnectionUri::parse("ftp://host:21"),
            Err(SyncError::InvalidUri { .. })
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ConnectionUri::parse("not a uri").is_err());
        assert!(ConnectionUri::parse("").is_err());
    }

    #[test]
    fn join_resolves_under_base_path() {
        let uri = ConnectionUri::parse("http://host:9090/remote").unwrap();
        let url = uri.join("api/v1/projects").unwrap();
        assert_eq!(url.as_str(), "http://host:9090/remote/api/v1/projects");
        let url = uri.join("/api/v1/projects").unwrap();
        assert_eq!(url.as_str(), "http://host:9090/remote/api/v1/projects");
    }

    #[test]
    fn ws_url_switches_scheme() {
        let plain = ConnectionUri::parse("http://host:9090").unwrap();
        assert_eq!(
            plain.ws_url("api/v1/events").unwrap().as_str(),
            "ws://host:9090/api/v1/events"
        );
        let tls = ConnectionUri::parse("https://host").unwrap();
        assert_eq!(
            tls.ws_url("api/v1/events").unwrap().as_str(),
            "wss://host/api/v1/events"
        );
    }

    #[test]
    fn host_excludes_port() {
        let uri = ConnectionUri::parse("http://10.0.1.10:9090").unwrap();
        assert_eq!(uri.host(), "10.0.1.10");
    }
}
