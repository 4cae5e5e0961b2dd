//! Cancellation and deadlines for a unit of transfer work.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::session::Session;

/// Cancellation, an optional deadline, and the owning [`Session`].
///
/// Scopes form a tree: cancelling a scope cancels its children, and shutting down the
/// session cancels every scope.
#[derive(Debug, Clone)]
pub struct Scope {
    session: Session,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    pub(crate) fn new(session: Session, token: CancellationToken) -> Self {
        Self {
            session,
            token,
            deadline: None,
        }
    }

    /// The session this scope belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A child scope, cancelled along with this one.
    pub fn child(&self) -> Scope {
        Scope {
            session: self.session.clone(),
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child scope with a deadline no later than `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Scope {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        child
    }

    /// A child scope which expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Scope {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancel this scope and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Was this scope (or an ancestor) cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Has the deadline passed?
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() > deadline)
    }

    /// Cancelled or expired.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// Resolves when the scope is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {},
                    () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {},
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_children() {
        let session = Session::default();
        let parent = session.scope();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(!session.is_shutdown());
    }

    #[test]
    fn child_cancel_leaves_parent() {
        let parent = Session::default().scope();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn deadlines_only_tighten() {
        let scope = Session::default().scope();
        let near = Instant::now() + Duration::from_secs(1);
        let far = near + Duration::from_secs(60);
        let tight = scope.with_deadline(near);
        assert_eq!(tight.with_deadline(far).deadline(), Some(near));
        assert!(!tight.is_expired());
    }

    #[tokio::test]
    async fn done_resolves_at_deadline() {
        let scope = Session::default().scope().with_timeout(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(5), scope.done())
            .await
            .expect("deadline should resolve the scope");
        assert!(scope.is_expired());
        assert!(scope.is_done());
    }
}
