//! Server state management.
//!
//! Tracks registered sessions and wires the coordinator and the aggregation
//! runner to their collaborators. The session registry is concurrent
//! (DashMap) for lock-free access; delivery to a session is fire-and-forget
//! through its outbound channel.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::invites::InviteCoordinator;
use crate::operations::FriendsRunner;
use crate::presence::{LocalPresence, Presence};
use crate::protocol::{AvatarId, ServerMessage};
use crate::store::ObjectStore;

/// Default decline-memory rotation interval in seconds. A remembered
/// rejection survives one to two intervals.
const DEFAULT_DECLINE_TIMEOUT_SECS: u64 = 600;

/// Default delay before a submitted secret is forwarded to the store, in
/// milliseconds. Makes guessing secrets at random slow.
const DEFAULT_SECRET_DELAY_MS: u64 = 1000;

/// Default maximum friends per avatar enforced by the in-memory store.
const DEFAULT_MAX_FRIENDS: usize = 50;

/// Default maximum outstanding secrets per avatar.
const DEFAULT_MAX_SECRETS_PER_AVATAR: usize = 3;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct SocialConfig {
    pub port: u16,
    pub decline_timeout_secs: u64,
    pub secret_delay_ms: u64,
    pub max_friends: usize,
    pub max_secrets_per_avatar: usize,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            decline_timeout_secs: DEFAULT_DECLINE_TIMEOUT_SECS,
            secret_delay_ms: DEFAULT_SECRET_DELAY_MS,
            max_friends: DEFAULT_MAX_FRIENDS,
            max_secrets_per_avatar: DEFAULT_MAX_SECRETS_PER_AVATAR,
        }
    }
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Display attributes of a registered session.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub name: String,
    pub appearance: String,
}

/// A registered session: display attributes, the live friends list kept for
/// local bookkeeping, and the outbound channel.
pub struct Session {
    pub name: String,
    pub appearance: String,
    pub friends: Vec<AvatarId>,
    sender: ClientSender,
}

/// Avatar id → live session for every connected client.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<AvatarId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with its display attributes and sender channel.
    pub fn register(&self, avatar_id: AvatarId, name: String, appearance: String, sender: ClientSender) {
        tracing::info!(avatar = avatar_id, name = name.as_str(), "Session registered");
        self.sessions.insert(
            avatar_id,
            Session {
                name,
                appearance,
                friends: Vec::new(),
                sender,
            },
        );
    }

    /// Unregister a session when the client disconnects.
    pub fn unregister(&self, avatar_id: AvatarId) {
        tracing::info!(avatar = avatar_id, "Session unregistered");
        self.sessions.remove(&avatar_id);
    }

    /// Check if an avatar is currently connected.
    pub fn is_online(&self, avatar_id: AvatarId) -> bool {
        self.sessions.contains_key(&avatar_id)
    }

    /// Send a message to a connected avatar. Returns true if sent.
    /// Fire-and-forget: there is no delivery confirmation.
    pub fn send_to(&self, avatar_id: AvatarId, message: ServerMessage) -> bool {
        if let Some(session) = self.sessions.get(&avatar_id) {
            session.sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Display attributes of a connected avatar.
    pub fn profile(&self, avatar_id: AvatarId) -> Option<SessionProfile> {
        self.sessions.get(&avatar_id).map(|session| SessionProfile {
            name: session.name.clone(),
            appearance: session.appearance.clone(),
        })
    }

    /// Extend a connected avatar's live friends list.
    pub fn extend_friends(&self, avatar_id: AvatarId, friend_id: AvatarId) {
        if let Some(mut session) = self.sessions.get_mut(&avatar_id) {
            if !session.friends.contains(&friend_id) {
                session.friends.push(friend_id);
            }
        }
    }

    /// The live friends list of a connected avatar (empty if offline).
    pub fn friends_of(&self, avatar_id: AvatarId) -> Vec<AvatarId> {
        self.sessions
            .get(&avatar_id)
            .map(|session| session.friends.clone())
            .unwrap_or_default()
    }

    /// Number of currently connected sessions.
    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Shared server state handed to every connection handler.
#[derive(Clone)]
pub struct SocialState {
    pub sessions: Arc<SessionRegistry>,
    pub coordinator: InviteCoordinator,
    pub runner: FriendsRunner,
    pub config: SocialConfig,
}

impl SocialState {
    /// Build the full state around a persistence collaborator, with presence
    /// answered from the local session registry.
    pub fn new(config: SocialConfig, store: Arc<dyn ObjectStore>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new(sessions.clone()));
        let coordinator = InviteCoordinator::new(sessions.clone(), store.clone(), &config);
        let runner = FriendsRunner::new(sessions.clone(), store, presence);
        Self {
            sessions,
            coordinator,
            runner,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &SessionRegistry, avatar_id: AvatarId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(avatar_id, format!("avatar-{avatar_id}"), "dna".to_string(), tx);
        rx
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = SessionRegistry::new();
        let _rx = connect(&registry, 1);

        assert!(registry.is_online(1));
        assert_eq!(registry.online_count(), 1);

        registry.unregister(1);
        assert!(!registry.is_online(1));
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn test_send_to_connected_avatar() {
        let registry = SessionRegistry::new();
        let mut rx = connect(&registry, 1);

        assert!(registry.send_to(1, ServerMessage::Pong));

        match rx.try_recv().unwrap() {
            ServerMessage::Pong => {}
            other => panic!("Expected Pong, got {:?}", other),
        }
    }

    #[test]
    fn test_send_to_offline_avatar_returns_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.send_to(99, ServerMessage::Pong));
    }

    #[test]
    fn test_profile_reads_display_attributes() {
        let registry = SessionRegistry::new();
        let _rx = connect(&registry, 1);

        let profile = registry.profile(1).unwrap();
        assert_eq!(profile.name, "avatar-1");
        assert_eq!(profile.appearance, "dna");

        assert!(registry.profile(2).is_none());
    }

    #[test]
    fn test_extend_friends_deduplicates() {
        let registry = SessionRegistry::new();
        let _rx = connect(&registry, 1);

        registry.extend_friends(1, 2);
        registry.extend_friends(1, 2);
        registry.extend_friends(1, 3);

        assert_eq!(registry.friends_of(1), vec![2, 3]);
        // Extending an offline avatar is a no-op.
        registry.extend_friends(9, 1);
        assert!(registry.friends_of(9).is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = SocialConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.decline_timeout_secs, 600);
        assert_eq!(config.secret_delay_ms, 1000);
        assert_eq!(config.max_friends, 50);
        assert_eq!(config.max_secrets_per_avatar, 3);
    }
}
