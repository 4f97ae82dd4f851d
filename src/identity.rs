//! Identity of the locally signed-in user.

/// Supplies the local user ID for the current session.
///
/// Kept abstract so the engine never depends on how authentication works;
/// the session layer hands it an implementation.
pub trait IdentityProvider: Send + Sync {
    fn local_user_id(&self) -> String;
}

/// A fixed identity for an established session.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    user_id: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn local_user_id(&self) -> String {
        self.user_id.clone()
    }
}
