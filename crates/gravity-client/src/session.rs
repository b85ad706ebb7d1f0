//! Credential holder for the sync manager.

use gravity_sync::ids::UserId;
use gravity_sync::transport::{Credentials, SessionProvider};
use std::sync::RwLock;

/// Holds one bearer credential, replaceable at runtime when the token is
/// refreshed and clearable on sign-out.
pub struct StaticSession {
    credentials: RwLock<Option<Credentials>>,
}

impl StaticSession {
    pub fn new(user_id: UserId, bearer: impl Into<String>) -> Self {
        Self {
            credentials: RwLock::new(Some(Credentials {
                user_id,
                bearer: bearer.into(),
            })),
        }
    }

    /// Replace the bearer token, keeping the user.
    pub fn refresh(&self, bearer: impl Into<String>) {
        let mut guard = self.credentials.write().unwrap_or_else(|e| e.into_inner());
        if let Some(creds) = guard.as_mut() {
            creds.bearer = bearer.into();
        }
    }

    /// Drop the credential; the manager pauses on its next cycle.
    pub fn clear(&self) {
        *self.credentials.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl SessionProvider for StaticSession {
    fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_and_clear() {
        let session = StaticSession::new(UserId::new("u1").unwrap(), "t1");
        assert_eq!(session.credentials().unwrap().bearer, "t1");

        session.refresh("t2");
        assert_eq!(session.credentials().unwrap().bearer, "t2");

        session.clear();
        assert!(session.credentials().is_none());
    }
}
