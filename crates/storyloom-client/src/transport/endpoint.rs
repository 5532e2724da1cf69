use url::Url;

/// Base address of the run socket endpoint.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    /// The WebSocket URL or bare host
    pub base: String,
    /// Whether to use TLS (wss:// vs ws://) when the base carries no scheme
    pub use_tls: bool,
}

impl SocketEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        // Auto-detect TLS based on URL
        let use_tls = base.starts_with("wss://")
            || base.starts_with("https://")
            || (!base.starts_with("ws://")
                && !base.starts_with("http://")
                && !base.contains("127.0.0.1")
                && !base.contains("localhost"));
        Self { base, use_tls }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// `{base}/runs/{run_id}/ws`, with the run id percent-encoded as one segment.
    pub fn run_url(&self, run_id: &str) -> Result<Url, url::ParseError> {
        let mut raw = self.base.trim_end_matches('/').to_string();

        // Normalize scheme
        if let Some(rest) = raw.strip_prefix("https://") {
            raw = format!("wss://{rest}");
        } else if let Some(rest) = raw.strip_prefix("http://") {
            raw = format!("ws://{rest}");
        } else if !raw.starts_with("ws://") && !raw.starts_with("wss://") {
            raw = if self.use_tls {
                format!("wss://{raw}")
            } else {
                format!("ws://{raw}")
            };
        }

        // Normalize localhost to avoid IPv6 issues
        if raw.contains("localhost") {
            raw = raw.replace("localhost", "127.0.0.1");
        }

        let mut url = Url::parse(&raw)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["runs", run_id, "ws"]);
        Ok(url)
    }
}
