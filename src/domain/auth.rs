#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Admin,
    User { user_id: String },
}

/// Caller identity as vouched for by the session provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub actor: Actor,
    pub username: Option<String>,
}

impl AuthContext {
    pub fn admin() -> Self {
        Self {
            actor: Actor::Admin,
            username: None,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            actor: Actor::User {
                user_id: user_id.into(),
            },
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.actor, Actor::Admin)
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.actor {
            Actor::User { user_id } => Some(user_id),
            Actor::Admin => None,
        }
    }

    /// Admins act on anything; users only on records they own.
    pub fn may_act_for(&self, owner_id: &str) -> bool {
        self.is_admin() || self.user_id() == Some(owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::AuthContext;

    #[test]
    fn admin_may_act_for_anyone() {
        assert!(AuthContext::admin().may_act_for("user-a"));
    }

    #[test]
    fn user_may_act_only_for_self() {
        let context = AuthContext::user("user-a");

        assert!(context.may_act_for("user-a"));
        assert!(!context.may_act_for("user-b"));
        assert_eq!(context.user_id(), Some("user-a"));
    }
}
