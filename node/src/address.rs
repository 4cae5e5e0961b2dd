//! Logical resource addresses and the URLs built from them.
//!
//! An [`Address`] holds the parts common to every scheme a node speaks (host, root,
//! namespace, term, reference, plus a protocol and method for direct requests) and formats
//! them into scheme specific URLs:
//!
//! | builder | form |
//! |---|---|
//! | [`Address::node_root`] | `node://host/namespace/reference` |
//! | [`Address::https_root`] | `https://host/root/namespace/term/reference` |
//! | [`Address::api_root`] | `api://host/root/term` |
//! | [`Address::cache_root`] | `cache://host/root/term` |
//! | [`Address::file_root`] | `file://host/namespace/reference` |
//! | [`Address::location`] | `protocol://host/root/namespace/term/reference` |
//!
//! Empty parts are left out of the path.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Method;
use thiserror::Error;
use url::Url;

use crate::uri::{IntoUri as _, ParseUriError};

/// Errors from building URLs or requests out of an [`Address`].
#[derive(Debug, Error)]
pub enum AddressError {
    /// The formatted URL did not parse.
    #[error("invalid address URL: {0}")]
    Url(#[from] url::ParseError),

    /// The URL could not be used as a request URI.
    #[error(transparent)]
    Uri(#[from] ParseUriError),

    /// The address has no protocol, so it has no direct location.
    #[error("address has no protocol")]
    MissingProtocol,

    /// The address method is not an HTTP method.
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// A locator string could not be split into address parts.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    /// The request could not be assembled.
    #[error(transparent)]
    Http(#[from] http::Error),
}

/// The current values of an address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressParts {
    /// Scheme used by [`Address::location`].
    pub protocol: String,

    /// Host, usually the node or cache name.
    pub host: String,

    /// API root, e.g. `v2`.
    pub root: String,

    /// Repository namespace, e.g. `library/ubuntu`.
    pub namespace: String,

    /// API term, e.g. `blobs/uploads`.
    pub term: String,

    /// Tag or digest.
    pub reference: String,

    /// Method used by [`Address::request`].
    pub method: String,
}

/// A mutable, thread-safe builder of resource URLs.
///
/// Setters replace the stored parts as a whole: readers always see a consistent set of
/// parts, never a half-applied update. Clones are independent copies.
pub struct Address {
    parts: ArcSwap<AddressParts>,
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&*self.parts.load()).finish()
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Address {
    fn clone(&self) -> Self {
        Self {
            parts: ArcSwap::new(self.parts.load_full()),
        }
    }
}

impl From<AddressParts> for Address {
    fn from(parts: AddressParts) -> Self {
        Self {
            parts: ArcSwap::new(Arc::new(parts)),
        }
    }
}

macro_rules! part {
    ($set:ident, $get:ident, $field:ident, $doc:literal) => {
        #[doc = concat!("Set the ", $doc, ".")]
        pub fn $set(&self, value: impl Into<String>) -> &Self {
            let value = value.into();
            self.parts.rcu(|parts| {
                let mut parts = AddressParts::clone(parts);
                parts.$field = value.clone();
                parts
            });
            self
        }

        #[doc = concat!("The ", $doc, ".")]
        pub fn $get(&self) -> String {
            self.parts.load().$field.clone()
        }
    };
}

impl Address {
    /// An empty address.
    pub fn new() -> Self {
        AddressParts::default().into()
    }

    part!(set_protocol, protocol, protocol, "protocol");
    part!(set_host, host, host, "host");
    part!(set_root, root, root, "API root");
    part!(set_namespace, namespace, namespace, "namespace");
    part!(set_term, term, term, "API term");
    part!(set_reference, reference, reference, "reference");
    part!(set_method, method, method, "request method");

    /// All parts, as they are now.
    pub fn snapshot(&self) -> AddressParts {
        AddressParts::clone(&self.parts.load())
    }

    /// `node://host/namespace/reference`
    pub fn node_root(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        build("node", &parts.host, &[&parts.namespace, &parts.reference])
    }

    /// `https://host/root/namespace/term/reference`
    pub fn https_root(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        build("https", &parts.host, &full_path(&parts))
    }

    /// `http://host/root/namespace/term/reference`
    pub fn http_root(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        build("http", &parts.host, &full_path(&parts))
    }

    /// `api://host/root/term`
    pub fn api_root(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        build("api", &parts.host, &[&parts.root, &parts.term])
    }

    /// The API root with each allowed method as a `method` query parameter.
    pub fn api<I, M>(&self, methods: I) -> Result<Url, AddressError>
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        let mut url = self.api_root()?;
        {
            let mut query = url.query_pairs_mut();
            for method in methods {
                query.append_pair("method", method.as_ref());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// `cache://host/root/term`
    pub fn cache_root(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        build("cache", &parts.host, &[&parts.root, &parts.term])
    }

    /// `file://host/namespace/reference`
    pub fn file_root(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        build("file", &parts.host, &[&parts.namespace, &parts.reference])
    }

    /// `protocol://host/root/namespace/term/reference`
    pub fn location(&self) -> Result<Url, AddressError> {
        let parts = self.parts.load();
        if parts.protocol.is_empty() {
            return Err(AddressError::MissingProtocol);
        }
        build(&parts.protocol, &parts.host, &full_path(&parts))
    }

    /// The request method (GET when unset) and [`Address::location`].
    pub fn api_location(&self) -> Result<(Method, Url), AddressError> {
        Ok((self.parsed_method()?, self.location()?))
    }

    /// A request to [`Address::location`] with the address' method.
    pub fn request(
        &self,
        body: hyperdriver::Body,
    ) -> Result<hyperdriver::body::Request, AddressError> {
        let (method, location) = self.api_location()?;
        Ok(http::Request::builder()
            .method(method)
            .uri(location.into_uri()?)
            .body(body)?)
    }

    /// A request to [`Address::https_root`]: GET without a body, POST with one.
    pub fn https_request(
        &self,
        body: Option<hyperdriver::Body>,
    ) -> Result<hyperdriver::body::Request, AddressError> {
        root_request(self.https_root()?, body)
    }

    /// A request to [`Address::http_root`]: GET without a body, POST with one.
    pub fn http_request(
        &self,
        body: Option<hyperdriver::Body>,
    ) -> Result<hyperdriver::body::Request, AddressError> {
        root_request(self.http_root()?, body)
    }

    /// Take reference, host and namespace from `ref://reference@host/namespace`.
    ///
    /// Parts missing from the URL are left unchanged.
    pub fn apply_reference(&self, reference: &Url) -> &Self {
        if !reference.username().is_empty() {
            self.set_reference(reference.username());
        }
        if let Some(host) = reference.host_str().filter(|host| !host.is_empty()) {
            self.set_host(host);
        }
        let namespace = reference.path().trim_matches('/');
        if !namespace.is_empty() {
            self.set_namespace(namespace);
        }
        self
    }

    /// Build an address from a `reference@root://term` locator.
    ///
    /// The reference is optional: `v2://blobs/uploads` sets only the root and term.
    pub fn from_node_locator(locator: &str) -> Result<Self, AddressError> {
        let (head, term) = locator
            .split_once("://")
            .ok_or_else(|| AddressError::InvalidLocator(locator.to_owned()))?;
        let (reference, root) = match head.rsplit_once('@') {
            Some((reference, root)) => (reference, root),
            None => ("", head),
        };
        if root.is_empty() {
            return Err(AddressError::InvalidLocator(locator.to_owned()));
        }

        Ok(AddressParts {
            root: root.to_owned(),
            term: term.trim_matches('/').to_owned(),
            reference: reference.to_owned(),
            ..Default::default()
        }
        .into())
    }

    fn parsed_method(&self) -> Result<Method, AddressError> {
        let parts = self.parts.load();
        if parts.method.is_empty() {
            return Ok(Method::GET);
        }
        Method::from_bytes(parts.method.as_bytes())
            .map_err(|_| AddressError::InvalidMethod(parts.method.clone()))
    }
}

fn full_path(parts: &AddressParts) -> [&str; 4] {
    [&parts.root, &parts.namespace, &parts.term, &parts.reference]
}

fn build(scheme: &str, host: &str, segments: &[&str]) -> Result<Url, AddressError> {
    let mut url = format!("{scheme}://{host}");
    for segment in segments
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
    {
        url.push('/');
        url.push_str(segment);
    }
    Ok(Url::parse(&url)?)
}

fn root_request(
    location: Url,
    body: Option<hyperdriver::Body>,
) -> Result<hyperdriver::body::Request, AddressError> {
    let method = if body.is_some() {
        Method::POST
    } else {
        Method::GET
    };
    Ok(http::Request::builder()
        .method(method)
        .uri(location.into_uri()?)
        .body(body.unwrap_or_else(hyperdriver::Body::empty))?)
}
