//! Presence collaborator boundary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::AvatarId;
use crate::state::SessionRegistry;

/// Answers whether an avatar currently has an active session somewhere.
#[async_trait]
pub trait Presence: Send + Sync {
    async fn check_online(&self, avatar_id: AvatarId) -> bool;
}

/// Presence answered from this process's own session registry.
pub struct LocalPresence {
    sessions: Arc<SessionRegistry>,
}

impl LocalPresence {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Presence for LocalPresence {
    async fn check_online(&self, avatar_id: AvatarId) -> bool {
        self.sessions.is_online(avatar_id)
    }
}
