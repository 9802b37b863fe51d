//! Browser redirection.
//!
//! The checkout hands the customer to a hosted payment page through the
//! [`Navigator`] seam. [`SystemBrowser`] only opens http(s) URLs whose host
//! is on the configured allowlist.

use reqwest::Url;
use tracing::info;

use crate::config::CheckoutConfig;
use crate::error::{Error, Result};

const REDIRECT_URL_MAX_LEN: usize = 2048;

pub trait Navigator: Send + Sync + 'static {
    /// Send the user to `url`.
    fn redirect(&self, url: &str) -> Result<()>;
}

/// Check a redirect target: http(s), no credentials, bounded length, and a
/// host equal to or below an allowlisted one. Plain http is accepted only for
/// localhost.
pub fn validate_redirect_url(raw: &str, allowed_hosts: &[String]) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Navigation("Redirect URL cannot be empty".into()));
    }
    if trimmed.len() > REDIRECT_URL_MAX_LEN {
        return Err(Error::Navigation("Redirect URL is too long".into()));
    }

    let parsed =
        Url::parse(trimmed).map_err(|e| Error::Navigation(format!("Invalid redirect URL: {e}")))?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "https" && scheme != "http" {
        return Err(Error::Navigation("Only http/https URLs are allowed".into()));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(Error::Navigation("Credentialed URLs are not allowed".into()));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Navigation("Redirect URL is missing a host".into()))?
        .to_ascii_lowercase();
    if matches!(host.as_str(), "localhost" | "127.0.0.1") {
        return Ok(parsed);
    }
    if scheme != "https" {
        return Err(Error::Navigation(format!("Refusing plain http redirect to {host}")));
    }

    let allowed = allowed_hosts
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .any(|base| host == base || host.ends_with(&format!(".{base}")));
    if !allowed {
        return Err(Error::Navigation(format!("Redirect host is not allowlisted: {host}")));
    }
    Ok(parsed)
}

/// Opens validated URLs in the system browser.
#[derive(Debug, Clone)]
pub struct SystemBrowser {
    allowed_hosts: Vec<String>,
}

impl SystemBrowser {
    pub fn new(config: &CheckoutConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_gateway_hosts.clone(),
        }
    }
}

impl Navigator for SystemBrowser {
    fn redirect(&self, url: &str) -> Result<()> {
        let parsed = validate_redirect_url(url, &self.allowed_hosts)?;
        webbrowser::open(parsed.as_str())
            .map_err(|e| Error::Navigation(format!("Failed to open browser: {e}")))?;
        info!(host = parsed.host_str().unwrap_or_default(), "Opened payment page");
        Ok(())
    }
}
