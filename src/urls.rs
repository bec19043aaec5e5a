//! Endpoint string normalization shared by readers and recorders.

use thiserror::Error;
use url::Url;

/// Errors that can emerge while sanitising an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The input cannot be turned into a usable HTTP URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Normalizes a raw endpoint string into a URL with an explicit scheme.
///
/// Inputs containing whitespace are rejected, as are malformed scheme
/// prefixes such as `ttp://host` or `http:/host`. Scheme-less inputs must
/// look like a host (`localhost.com`, `127.0.0.1`) and get `http://`
/// prepended; paths are preserved verbatim. The function is idempotent on
/// its own successful output.
pub fn sanitise_url(input: &str) -> Result<String, Error> {
    let invalid = || Error::InvalidUrl(input.to_string());

    if input.is_empty() || input.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    if let Some((scheme, rest)) = input.split_once("://") {
        if !matches!(scheme, "http" | "https") || rest.is_empty() {
            return Err(invalid());
        }
        Url::parse(input).map_err(|_| invalid())?;
        return Ok(input.to_string());
    }

    // A colon in the authority segment without "://" is a mangled scheme,
    // e.g. "http:/localhost" or "https:localhost".
    let authority = input.split('/').next().unwrap_or("");
    if authority.contains(':') {
        return Err(invalid());
    }

    // Scheme-less inputs must at least look like a host.
    if !authority.contains('.') {
        return Err(invalid());
    }

    let candidate = format!("http://{input}");
    Url::parse(&candidate).map_err(|_| invalid())?;
    Ok(candidate)
}
