//! Remote verification over HTTP.
//!
//! Each record is posted as an urlencoded form on its own task. The engine
//! never waits on the result and failures are only logged.

use std::time::Duration;

use tagwatch_core::{TagError, Verifier, VerifyRecord};
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Posts verification records to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    client: reqwest::Client,
    url: Url,
}

impl HttpVerifier {
    /// Build a verifier for `url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built or
    /// the URL is not absolute http(s).
    pub fn new(url: &str) -> Result<Self, TagError> {
        let invalid = |reason: String| {
            TagError::ConfigValidationError(format!("verify_url '{url}' {reason}"))
        };
        let url = Url::parse(url).map_err(|e| invalid(format!("is not a URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("has unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().unwrap_or_default().is_empty() {
            return Err(invalid("has no host".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("tagwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TagError::ConfigValidationError(format!("HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    /// Target URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl Verifier for HttpVerifier {
    fn submit(&self, record: VerifyRecord) {
        let request = self.client.post(self.url.clone()).form(&record);
        let address = record.address;
        tokio::spawn(async move {
            match request.send().await.and_then(reqwest::Response::error_for_status) {
                Ok(response) => {
                    debug!(address = %address, status = %response.status(), "Device verified");
                }
                Err(e) => warn!(address = %address, error = %e, "Device verification failed"),
            }
        });
    }
}
