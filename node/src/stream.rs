//! Named, resumable remote resources.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use transit::{
    Position, Scope, StableDescriptor, TransientDescriptor, TransitError, TransitionHandle,
};
use url::Url;

use crate::address::Address;
use crate::digest::HashFn;
use crate::error::{NodeError, NodeResult};
use crate::node::Node;
use crate::state::State;
use crate::transition::write_cache;
use crate::transport::DEFAULT_CONTENT_TYPE;

/// Accept any content type.
pub const ACCEPT_ANY: &str = "*/*";

/// One remote resource: its address, its verified state and the transfer moving it.
///
/// Clones share the same resource.
#[derive(Clone)]
pub struct StreamDescriptor {
    inner: Arc<Inner>,
}

struct Inner {
    accepts: RwLock<String>,
    address: Address,
    state: Mutex<State>,
    transient: TransientDescriptor,
    scope: Scope,
}

impl fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("accepts", &*self.inner.accepts.read())
            .field("address", &self.inner.address)
            .field("state", &*self.inner.state.lock())
            .field("transient", &self.inner.transient)
            .finish()
    }
}

impl StreamDescriptor {
    /// Bootstrap a resource.
    ///
    /// `resolve` yields the resource address and where its content currently lives. The
    /// content is fetched once through `node` and must hash (with `hash`) to
    /// `expected_hash`. Transitions then deliver the content to the node cache at the
    /// address' API path.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn create<F>(
        node: &Node,
        resolve: F,
        expected_hash: impl Into<Vec<u8>>,
        hash: HashFn,
    ) -> NodeResult<Self>
    where
        F: FnOnce() -> NodeResult<(Address, Url)>,
    {
        let (address, location) = resolve()?;
        let transport = node.transport();
        let scope = transport.session().scope();
        tracing::debug!(%location, "fetching stream content");

        let response = node
            .client()
            .get(&location)
            .scope(scope.clone())
            .send()
            .await?
            .error_for_status()?;
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_owned();
        let content = response.bytes().await?;
        let size = content.len() as u64;

        let digest = hash(&content[..])?;
        let mut state = State::start(size, expected_hash);
        state.set_offset(size)?;
        state.commit(&content_type, &digest)?;

        let transient = TransientDescriptor::new();
        transient.set_expected(size)?;
        transient.set_transition(write_cache(node, content_type.as_str()));

        let source = match transport.source(&scope, &location) {
            Ok(source) => source,
            Err(err) => {
                tracing::debug!(%location, error = %err, "source is not cached, keeping fetched content");
                StableDescriptor::from_bytes(&scope, content)
            }
        };
        transient.set_source(source)?;

        let destination = transport.cache().url(address.api_root()?.path())?;
        transient.set_location(destination);

        Ok(Self {
            inner: Arc::new(Inner {
                accepts: RwLock::new(ACCEPT_ANY.to_owned()),
                address,
                state: Mutex::new(state),
                transient,
                scope,
            }),
        })
    }

    /// Media types accepted by [`StreamDescriptor::update`].
    pub fn accepts(&self) -> String {
        self.inner.accepts.read().clone()
    }

    /// Set the accepted media types, e.g. `application/json, text/plain` or `*/*`.
    pub fn set_accepts(&self, accepts: impl Into<String>) -> &Self {
        *self.inner.accepts.write() = accepts.into();
        self
    }

    /// The resource address.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// The verified state of the resource.
    pub fn state(&self) -> State {
        self.inner.state.lock().clone()
    }

    /// The transfer driving this resource.
    pub fn transient(&self) -> &TransientDescriptor {
        &self.inner.transient
    }

    /// See [`TransientDescriptor::position`].
    pub fn position(&self) -> Position {
        self.inner.transient.position()
    }

    /// See [`TransientDescriptor::wait`].
    pub async fn wait(&self, timeout: Duration) -> Result<(), TransitError> {
        self.inner.transient.wait(timeout).await
    }

    /// See [`TransientDescriptor::should_transition`].
    pub fn should_transition(&self, scope: &Scope) -> Result<TransitionHandle, TransitError> {
        self.inner.transient.should_transition(scope)
    }

    /// The current source of the content.
    pub fn source(&self) -> Option<StableDescriptor> {
        self.inner.transient.source()
    }

    /// Set where the next transition delivers to.
    pub fn set_location(&self, location: Url) -> &Self {
        self.inner.transient.set_location(location);
        self
    }

    /// Cancel the bootstrap scope and any running transition.
    pub fn cancel(&self) {
        self.inner.scope.cancel();
        self.inner.transient.cancel();
    }

    /// Accept content confirmed at the destination as the new source of truth.
    ///
    /// The content type must be accepted. Until the transfer is complete there is nothing
    /// to confirm and this does nothing. Once complete, a new state is committed against
    /// `checksum` and the source is re-validated.
    pub fn update(&self, scope: &Scope, content_type: &str, checksum: &[u8]) -> NodeResult<()> {
        if !self.accepts_type(content_type) {
            return Err(NodeError::Unacceptable(content_type.to_owned()));
        }

        let position = self.position();
        if let Some(err) = position.error.clone() {
            return Err(err.into());
        }
        if !position.is_complete() {
            tracing::trace!(%position, "update before completion");
            return Ok(());
        }

        let mut state = State::start(position.expected, checksum);
        state.set_offset(position.expected)?;
        state.commit(content_type, checksum)?;
        state.is_stable()?;

        let source = self
            .inner
            .transient
            .source()
            .ok_or(TransitError::Unset("source"))?;
        source.reset(scope);
        self.inner.transient.set_source(source)?;
        *self.inner.state.lock() = state;
        Ok(())
    }

    fn accepts_type(&self, content_type: &str) -> bool {
        let accepts = self.inner.accepts.read();
        accepts.contains(ACCEPT_ANY) || accepts.contains(content_type)
    }
}
