//! User-token source consulted before every synchronization attempt.

use std::sync::{Arc, RwLock};

use crate::error::{PersistenceError, Result};
use crate::model::UserToken;

/// Supplies the current user token.
///
/// The token may be rotated by the login layer at any time; the sync
/// controller asks again before each pass so both stores use the same one.
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> Result<UserToken>;
}

/// Token holder shared between the login layer and the sync controller.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    slot: Arc<RwLock<Option<UserToken>>>,
}

impl SharedToken {
    pub fn new(token: UserToken) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(token))),
        }
    }

    /// Replace the token (login, refresh, or account switch).
    pub fn rotate(&self, token: UserToken) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(token);
    }

    /// Forget the token (logout). Passes fail until a new one is set.
    pub fn clear(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl TokenProvider for SharedToken {
    fn current_token(&self) -> Result<UserToken> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| PersistenceError::unavailable("No user token available"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_is_visible_to_clones() {
        let tokens = SharedToken::new(UserToken::new("alice-1"));
        let seen_by_controller = tokens.clone();

        tokens.rotate(UserToken::new("alice-2"));
        assert_eq!(
            seen_by_controller.current_token().unwrap(),
            UserToken::new("alice-2")
        );
    }

    #[test]
    fn test_cleared_token_is_unavailable() {
        let tokens = SharedToken::new(UserToken::new("bob"));
        tokens.clear();
        assert!(matches!(
            tokens.current_token(),
            Err(PersistenceError::Unavailable { .. })
        ));
        assert!(SharedToken::default().current_token().is_err());
    }
}
