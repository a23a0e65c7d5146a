use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Admin,
    Vendor,
    System,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Vendor => write!(f, "vendor"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Who is performing a call.
///
/// Every service operation takes this explicitly; there is no ambient
/// session state, so tests can supply any caller deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: String,
    pub role: ActorRole,
}

impl ActorContext {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            actor_id: id.into(),
            role: ActorRole::Admin,
        }
    }

    pub fn vendor(id: impl Into<String>) -> Self {
        Self {
            actor_id: id.into(),
            role: ActorRole::Vendor,
        }
    }

    /// Background tasks (reconciliation, anchoring) act as the system.
    pub fn system() -> Self {
        Self {
            actor_id: "system".to_string(),
            role: ActorRole::System,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ActorRole::Admin
    }
}

impl fmt::Display for ActorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.actor_id)
    }
}
