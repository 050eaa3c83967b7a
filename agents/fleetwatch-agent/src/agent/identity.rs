//! Agent identity
//!
//! The identity (server id + secret key) authenticates the agent to the
//! backend. It is read from configuration at startup or obtained through a
//! registration exchange, after which it never changes.

use parking_lot::RwLock;
use std::sync::Arc;

/// Identity tuple for this agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentity {
    pub server_id: u64,
    pub secret_key: String,
    pub registration_token: Option<String>,
}

impl AgentIdentity {
    /// True when the agent can authenticate without registering
    pub fn is_configured(&self) -> bool {
        self.server_id > 0 && !self.secret_key.is_empty()
    }
}

/// Shared, read-mostly handle to the current identity
#[derive(Debug, Clone, Default)]
pub struct IdentityHandle {
    inner: Arc<RwLock<AgentIdentity>>,
}

impl IdentityHandle {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            inner: Arc::new(RwLock::new(identity)),
        }
    }

    /// Snapshot of the current identity
    pub fn get(&self) -> AgentIdentity {
        self.inner.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.inner.read().is_configured()
    }

    /// Install the identity returned by a successful registration
    pub fn set_registered(&self, server_id: u64, secret_key: String) -> AgentIdentity {
        let mut inner = self.inner.write();
        inner.server_id = server_id;
        inner.secret_key = secret_key;
        inner.registration_token = None;
        inner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_configured() {
        assert!(!AgentIdentity::default().is_configured());
        assert!(!AgentIdentity {
            server_id: 3,
            ..Default::default()
        }
        .is_configured());
        assert!(AgentIdentity {
            server_id: 3,
            secret_key: "k".into(),
            registration_token: None,
        }
        .is_configured());
    }

    #[test]
    fn test_set_registered_clears_token() {
        let handle = IdentityHandle::new(AgentIdentity {
            server_id: 0,
            secret_key: String::new(),
            registration_token: Some("tok".into()),
        });
        let identity = handle.set_registered(7, "key".into());
        assert_eq!(identity.server_id, 7);
        assert!(identity.registration_token.is_none());
        assert!(handle.is_configured());
    }
}
