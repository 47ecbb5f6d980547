//! Boundary to the authentication and authorization service.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::adapter::AdapterError;
use crate::config::ThingSettings;

pub const THING_ENTITY: &str = "thing";
pub const PUBLISH: &str = "publish";
pub const SUBSCRIBE: &str = "subscribe";

/// Access check: may `subject` perform `action` on `object`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeReq {
    pub subject: String,
    pub object: String,
    pub action: String,
    pub entity_type: String,
}

impl AuthorizeReq {
    pub fn thing(subject: &str, channel: &str, action: &str) -> Self {
        Self {
            subject: subject.to_string(),
            object: channel.to_string(),
            action: action.to_string(),
            entity_type: THING_ENTITY.to_string(),
        }
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolves a thing key to the thing's id.
    async fn identify(&self, key: &str) -> Result<String, AdapterError>;

    async fn authorize(&self, req: &AuthorizeReq) -> Result<bool, AdapterError>;
}

/// Auth service backed by the configured list of things.
///
/// A thing may publish and subscribe on every channel it lists; `*` grants
/// every channel.
#[derive(Debug, Default)]
pub struct StaticAuth {
    keys: HashMap<String, String>,
    channels: HashMap<String, HashSet<String>>,
}

impl StaticAuth {
    pub fn new(things: &[ThingSettings]) -> Self {
        let mut auth = Self::default();
        for thing in things {
            auth.keys.insert(thing.key.clone(), thing.id.clone());
            auth.channels
                .entry(thing.id.clone())
                .or_default()
                .extend(thing.channels.iter().cloned());
        }
        auth
    }
}

#[async_trait]
impl AuthService for StaticAuth {
    async fn identify(&self, key: &str) -> Result<String, AdapterError> {
        self.keys.get(key).cloned().ok_or(AdapterError::Unauthorized)
    }

    async fn authorize(&self, req: &AuthorizeReq) -> Result<bool, AdapterError> {
        if req.entity_type != THING_ENTITY {
            return Ok(false);
        }
        Ok(self
            .channels
            .get(&req.subject)
            .is_some_and(|channels| channels.contains(&req.object) || channels.contains("*")))
    }
}
