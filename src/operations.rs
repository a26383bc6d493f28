//! Aggregation operations.
//!
//! Short-lived, per-request operations that sequence dependent store
//! lookups to completion and send exactly one terminal response. A
//! friends-list request resolves the requester's own record, then each
//! friend's record strictly one at a time, then fans out one presence check
//! per friend; the response is sent only once every sub-query has settled.
//!
//! The contract is complete-or-nothing: a store failure or a record of the
//! wrong kind aborts the whole operation with a log line and no response.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::presence::Presence;
use crate::protocol::{AvatarId, FriendSummary, RecordDetails, ServerMessage};
use crate::state::SessionRegistry;
use crate::store::{ObjectStore, Record};

/// Liveness bookkeeping for in-flight operations. Not consulted for the
/// correctness of any single operation.
#[derive(Default)]
pub struct OperationTracker {
    active: AtomicUsize,
}

impl OperationTracker {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

struct OperationGuard {
    tracker: Arc<OperationTracker>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Runs aggregation operations against the store and presence collaborators.
/// Cheap to clone; all fields are shared.
#[derive(Clone)]
pub struct FriendsRunner {
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn ObjectStore>,
    presence: Arc<dyn Presence>,
    tracker: Arc<OperationTracker>,
}

impl FriendsRunner {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn ObjectStore>,
        presence: Arc<dyn Presence>,
    ) -> Self {
        Self {
            sessions,
            store,
            presence,
            tracker: Arc::new(OperationTracker::default()),
        }
    }

    /// Number of in-flight operations (for `/stats`).
    pub fn active_operations(&self) -> usize {
        self.tracker.active()
    }

    fn begin_operation(&self) -> OperationGuard {
        self.tracker.active.fetch_add(1, Ordering::Relaxed);
        OperationGuard {
            tracker: self.tracker.clone(),
        }
    }

    /// Start a friends-list operation for the sending avatar.
    pub fn get_friends_list(&self, sender: AvatarId) {
        let operation = GetFriendsListOperation {
            runner: self.clone(),
            op_id: Uuid::new_v4(),
            sender,
            friend_ids: Vec::new(),
            friends: Vec::new(),
            online_friends: Vec::new(),
            current_friend_idx: 0,
        };
        tokio::spawn(operation.run());
    }

    /// Start a single-record details operation.
    pub fn get_avatar_details(&self, sender: AvatarId, avatar_id: AvatarId) {
        let operation = GetAvatarDetailsOperation {
            runner: self.clone(),
            op_id: Uuid::new_v4(),
            sender,
            avatar_id,
        };
        tokio::spawn(operation.run());
    }
}

/// Assembles one friends list:
/// self record → each friend's record in list order → one presence check
/// per friend → one response, then one online notice per online friend.
struct GetFriendsListOperation {
    runner: FriendsRunner,
    op_id: Uuid,
    sender: AvatarId,
    friend_ids: Vec<AvatarId>,
    friends: Vec<FriendSummary>,
    online_friends: Vec<AvatarId>,
    current_friend_idx: usize,
}

impl GetFriendsListOperation {
    async fn run(mut self) {
        let _guard = self.runner.begin_operation();
        tracing::debug!(op = %self.op_id, sender = self.sender, "Starting friends-list operation");

        // Resolve the requester's own record for its friend-id list.
        let record = match self.runner.store.query_record(self.sender).await {
            Ok(Some(Record::Avatar(record))) => record,
            Ok(Some(_)) => {
                tracing::warn!(op = %self.op_id, sender = self.sender, "Requester record is not an avatar");
                return;
            }
            Ok(None) => {
                tracing::warn!(op = %self.op_id, sender = self.sender, "Requester record not found");
                return;
            }
            Err(error) => {
                tracing::warn!(op = %self.op_id, error = %error, "Requester lookup failed");
                return;
            }
        };

        self.friend_ids = record.friends;
        if self.friend_ids.is_empty() {
            self.send_friends_list();
            return;
        }

        // Resolve each friend strictly one at a time, in list order. The
        // sequential cursor bounds the load on the store; the next lookup
        // is issued only after the previous one has answered.
        while self.current_friend_idx < self.friend_ids.len() {
            let friend_id = self.friend_ids[self.current_friend_idx];
            let friend = match self.runner.store.query_record(friend_id).await {
                Ok(Some(Record::Avatar(friend))) => friend,
                Ok(Some(_)) => {
                    tracing::warn!(op = %self.op_id, friend = friend_id, "Friend record is not an avatar, aborting");
                    return;
                }
                Ok(None) => {
                    tracing::warn!(op = %self.op_id, friend = friend_id, "Friend record not found, aborting");
                    return;
                }
                Err(error) => {
                    tracing::warn!(op = %self.op_id, error = %error, "Friend lookup failed, aborting");
                    return;
                }
            };
            self.friends.push(FriendSummary {
                avatar_id: friend_id,
                name: friend.name,
                appearance: friend.appearance,
                companion_id: friend.companion_id,
            });
            self.current_friend_idx += 1;
        }

        // One presence check per friend, dispatched without ordering
        // constraints; the join completes only when every check has
        // answered.
        let checks = self.friend_ids.iter().copied().map(|friend_id| {
            let presence = self.runner.presence.clone();
            async move { (friend_id, presence.check_online(friend_id).await) }
        });
        for (friend_id, online) in join_all(checks).await {
            if online {
                self.online_friends.push(friend_id);
            }
        }

        self.send_friends_list();
    }

    fn send_friends_list(&self) {
        tracing::debug!(
            op = %self.op_id,
            sender = self.sender,
            friends = self.friends.len(),
            online = self.online_friends.len(),
            "Sending friends list"
        );
        self.runner.sessions.send_to(
            self.sender,
            ServerMessage::FriendsListResponse {
                friends: self.friends.clone(),
            },
        );
        for &friend_id in &self.online_friends {
            self.runner
                .sessions
                .send_to(self.sender, ServerMessage::FriendOnline { friend_id });
        }
    }
}

/// Resolves one record and returns its packed required fields, or a failure
/// flag when the record is missing.
struct GetAvatarDetailsOperation {
    runner: FriendsRunner,
    op_id: Uuid,
    sender: AvatarId,
    avatar_id: AvatarId,
}

impl GetAvatarDetailsOperation {
    async fn run(self) {
        let _guard = self.runner.begin_operation();

        let record = match self.runner.store.query_record(self.avatar_id).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(op = %self.op_id, error = %error, "Details lookup failed");
                return;
            }
        };

        let details = match record {
            Some(Record::Avatar(avatar)) => Some(RecordDetails::Avatar {
                name: avatar.name,
                appearance: avatar.appearance,
                companion_id: avatar.companion_id,
            }),
            Some(Record::Companion(companion)) => Some(RecordDetails::Companion {
                name: companion.name,
                owner_id: companion.owner_id,
            }),
            None => {
                tracing::debug!(op = %self.op_id, avatar = self.avatar_id, "Details for unknown record");
                None
            }
        };

        let success = details.is_some();
        self.runner.sessions.send_to(
            self.sender,
            ServerMessage::AvatarDetailsResponse {
                avatar_id: self.avatar_id,
                success,
                details,
            },
        );
    }
}
