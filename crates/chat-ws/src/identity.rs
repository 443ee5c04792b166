use chat_core::Sender;

/// Source of the signed-in user. Edits and sends are attributed to it.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<Sender>;
}

/// Fixed identity, for headless clients and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<Sender>,
}

impl StaticIdentity {
    pub fn new(user: Sender) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<Sender> {
        self.user.clone()
    }
}
