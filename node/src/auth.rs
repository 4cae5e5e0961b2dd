//! Request signing for secure node requests.
//!
//! A [`Node`](crate::Node) may carry an [`Authorize`] implementation. It is applied to requests
//! built by [`Node::secure_request`](crate::Node::secure_request); without one, secure requests
//! fail.

use std::fmt;

use http::HeaderValue;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors from signing a request.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The credential cannot be written as a header value.
    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The authorizer refused to sign the request.
    #[error("authorization failed: {0}")]
    Refused(String),
}

/// Signs outgoing requests.
pub trait Authorize: Send + Sync {
    /// Add credentials to the request.
    fn authorize(&self, parts: &mut http::request::Parts) -> Result<(), AuthorizeError>;
}

impl<F> Authorize for F
where
    F: Fn(&mut http::request::Parts) -> Result<(), AuthorizeError> + Send + Sync,
{
    fn authorize(&self, parts: &mut http::request::Parts) -> Result<(), AuthorizeError> {
        (self)(parts)
    }
}

/// Create a basic authentication header value, with the password being optional.
///
/// Basic authentication Base64 encodes the username and password, separated by a colon.
///
/// # Example
/// ```rust
/// use node::basic_auth;
///
/// let header = basic_auth("username", Some("password"));
/// assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
/// ```
pub fn basic_auth<U, P>(username: U, password: Option<P>) -> HeaderValue
where
    U: fmt::Display,
    P: fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

/// Authorization with a bearer token.
///
/// # Example
/// ```rust
/// use node::BearerAuth;
///
/// let auth = BearerAuth::new("my-secret");
/// let header = auth.header_value().unwrap();
///
/// assert_eq!(header.to_str().unwrap(), "Bearer my-secret");
/// ```
#[derive(Clone)]
pub struct BearerAuth(Zeroizing<String>);

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BearerAuth").field(&"****").finish()
    }
}

impl BearerAuth {
    /// Create a bearer authorization from a token.
    pub fn new(token: impl Into<String>) -> Self {
        BearerAuth(Zeroizing::new(token.into()))
    }

    /// The `Authorization` header value, marked sensitive.
    pub fn header_value(&self) -> Result<HeaderValue, AuthorizeError> {
        let header = Zeroizing::new(format!("Bearer {}", self.0.as_str()));
        let mut value = HeaderValue::from_str(&header)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl Authorize for BearerAuth {
    fn authorize(&self, parts: &mut http::request::Parts) -> Result<(), AuthorizeError> {
        if parts.headers.contains_key(http::header::AUTHORIZATION) {
            tracing::warn!("{} header already set", http::header::AUTHORIZATION);
            return Ok(());
        }
        parts
            .headers
            .append(http::header::AUTHORIZATION, self.header_value()?);
        Ok(())
    }
}

/// Basic authorization, with the password being optional.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: Option<Zeroizing<String>>,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl BasicAuth {
    /// Create a basic authorization.
    pub fn new(username: impl Into<String>, password: Option<impl Into<String>>) -> Self {
        BasicAuth {
            username: username.into(),
            password: password.map(|password| Zeroizing::new(password.into())),
        }
    }
}

impl Authorize for BasicAuth {
    fn authorize(&self, parts: &mut http::request::Parts) -> Result<(), AuthorizeError> {
        if parts.headers.contains_key(http::header::AUTHORIZATION) {
            tracing::warn!("{} header already set", http::header::AUTHORIZATION);
            return Ok(());
        }
        parts.headers.append(
            http::header::AUTHORIZATION,
            basic_auth(&self.username, self.password.as_deref()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> http::request::Parts {
        http::Request::builder()
            .uri("https://registry.example/v2/")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn bearer_sets_header_once() {
        let mut parts = parts();
        BearerAuth::new("token").authorize(&mut parts).unwrap();
        BearerAuth::new("other").authorize(&mut parts).unwrap();
        let values: Vec<_> = parts
            .headers
            .get_all(http::header::AUTHORIZATION)
            .iter()
            .collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Bearer token");
        assert!(values[0].is_sensitive());
    }

    #[test]
    fn closures_authorize() {
        let refuse = |_: &mut http::request::Parts| -> Result<(), AuthorizeError> {
            Err(AuthorizeError::Refused("no credentials".into()))
        };
        let err = refuse.authorize(&mut parts()).unwrap_err();
        assert_eq!(err.to_string(), "authorization failed: no credentials");
    }

    #[test]
    fn basic_without_password() {
        let mut parts = parts();
        BasicAuth::new("user", None::<String>)
            .authorize(&mut parts)
            .unwrap();
        assert_eq!(
            parts.headers[http::header::AUTHORIZATION],
            "Basic dXNlcjo="
        );
    }

    #[test]
    fn credentials_stay_out_of_debug_output() {
        let bearer = BearerAuth::new("s3cr3t-token");
        assert!(!format!("{bearer:?}").contains("s3cr3t-token"));
        assert_eq!(
            bearer.clone().header_value().unwrap(),
            "Bearer s3cr3t-token"
        );

        let basic = BasicAuth::new("user", Some("hunter2"));
        let debug = format!("{basic:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));

        let mut parts = parts();
        basic.authorize(&mut parts).unwrap();
        assert_eq!(
            parts.headers[http::header::AUTHORIZATION],
            basic_auth("user", Some("hunter2"))
        );
    }
}
