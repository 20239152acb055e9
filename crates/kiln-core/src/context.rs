use crate::{CancellationToken, SessionId};

/// Canonical per-operation context passed explicitly through Kiln's layers.
///
/// This type is intentionally small and `Clone` so callers can cheaply pass it
/// into background work. Cancellation is cooperative via [`CancellationToken`].
/// There is no ambient or process-wide fallback: whatever session an operation
/// should run under travels in the context it is handed.
#[derive(Clone, Debug)]
pub struct BuildContext {
    session: Option<SessionId>,
    cancel: CancellationToken,
}

impl BuildContext {
    /// A context with no session attached.
    ///
    /// Session-gated operations (snapshots, session-scoped cache keys) refuse
    /// to run under a detached context.
    pub fn detached() -> Self {
        Self {
            session: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(session: SessionId) -> Self {
        Self {
            session: Some(session),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clone the context, but replace the cancellation token with a child token.
    pub fn child(&self) -> Self {
        Self {
            session: self.session.clone(),
            cancel: self.cancel.child_token(),
        }
    }
}
