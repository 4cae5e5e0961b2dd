//! Converting URLs into request URIs.

use http::Uri;
use thiserror::Error;
use url::Url;

/// The provided URL cannot be a base URL, so it has no authority or path to request.
#[derive(Debug, Error)]
#[error("cannot be a base URL: {0}")]
pub struct CannotBeABase(Url);

/// Errors that can occur when turning a URL into a URI.
#[derive(Debug, Error)]
pub enum ParseUriError {
    /// An error occurred while parsing the URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The URL cannot be a base URL.
    #[error(transparent)]
    CannotBeABase(#[from] CannotBeABase),

    /// The URL parsed, but is not a valid URI.
    #[error("invalid URI: {0}")]
    Invalid(#[from] http::uri::InvalidUri),
}

/// Convert a value into a URI.
pub trait IntoUri {
    /// Convert the value into a URI.
    fn into_uri(self) -> Result<Uri, ParseUriError>;
}

impl IntoUri for Url {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        (&self).into_uri()
    }
}

impl IntoUri for &Url {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        if self.cannot_be_a_base() {
            return Err(CannotBeABase(self.clone()).into());
        }

        Ok(self.as_str().parse()?)
    }
}

impl IntoUri for Uri {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        Ok(self)
    }
}

impl IntoUri for &str {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        let url: Url = self.parse()?;
        url.into_uri()
    }
}

/// Parse a request URI back into a URL.
pub(crate) fn to_url(uri: &Uri) -> Result<Url, ParseUriError> {
    Ok(Url::parse(&uri.to_string())?)
}
