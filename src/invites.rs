//! Invitation coordination.
//!
//! Arbitrates friend-request negotiations between two connected clients:
//! creation, cancellation, availability polling, accept/decline resolution,
//! decline memoization, and the secret-code side channel that resolves into
//! the same friendship commit.
//!
//! All invite bookkeeping (the context table, the per-participant indexes,
//! the context counter, and the decline memory) lives behind one mutex so
//! every transition's index updates land atomically with respect to the
//! event being handled. Messages referencing unknown contexts are logged
//! and dropped: legitimate client races produce them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{
    AvailabilityCode, AvatarId, ConsideringCode, Context, DecisionCode, RequestSecretCode,
    ServerMessage, SubmitSecretCode,
};
use crate::state::{SessionRegistry, SocialConfig};
use crate::store::{ObjectStore, SecretResolution};

/// One in-flight friendship negotiation.
#[derive(Debug, Clone)]
struct Invite {
    context: Context,
    inviter_id: AvatarId,
    invitee_id: AvatarId,
    /// True once the invitee's client has been told about the request;
    /// a cancellation must then be actively pushed to the invitee.
    invitee_notified: bool,
    /// True when this invite was synthesized by the secret-code path.
    special_channel: bool,
}

/// Two-generation rolling cache of recent declines:
/// invitee → (inviter → decline code). New declines land in generation 1;
/// once per interval generation 1 rolls into generation 2, replacing it.
/// A remembered decline therefore survives one to two intervals, and the
/// cache stays bounded without per-entry expiry.
struct DeclineMemory {
    gen1: HashMap<AvatarId, HashMap<AvatarId, DecisionCode>>,
    gen2: HashMap<AvatarId, HashMap<AvatarId, DecisionCode>>,
    last_roll: Instant,
    interval: Duration,
}

impl DeclineMemory {
    fn new(interval: Duration) -> Self {
        Self {
            gen1: HashMap::new(),
            gen2: HashMap::new(),
            last_roll: Instant::now(),
            interval,
        }
    }

    fn record(&mut self, invitee_id: AvatarId, inviter_id: AvatarId, code: DecisionCode) {
        self.gen1
            .entry(invitee_id)
            .or_default()
            .insert(inviter_id, code);
    }

    /// The most recent decline from this invitee toward this inviter, if
    /// one is still remembered. Rolls the generations lazily.
    fn lookup(&mut self, invitee_id: AvatarId, inviter_id: AvatarId) -> Option<DecisionCode> {
        let now = Instant::now();
        if now.duration_since(self.last_roll) >= self.interval {
            self.gen2 = std::mem::take(&mut self.gen1);
            self.last_roll = now;
        }

        if let Some(code) = self
            .gen1
            .get(&invitee_id)
            .and_then(|inner| inner.get(&inviter_id))
        {
            return Some(*code);
        }
        self.gen2
            .get(&invitee_id)
            .and_then(|inner| inner.get(&inviter_id))
            .copied()
    }

    fn len(&self) -> usize {
        let count = |generation: &HashMap<AvatarId, HashMap<AvatarId, DecisionCode>>| {
            generation.values().map(HashMap::len).sum::<usize>()
        };
        count(&self.gen1) + count(&self.gen2)
    }
}

/// Process-wide invite bookkeeping, mutated atomically per transition.
struct InviteTables {
    invites: HashMap<Context, Invite>,
    inviters: HashMap<AvatarId, Context>,
    invitees: HashMap<AvatarId, Context>,
    next_context: Context,
    declines: DeclineMemory,
}

impl InviteTables {
    fn allocate_context(&mut self) -> Context {
        let context = self.next_context;
        self.next_context += 1;
        context
    }

    /// Remove an invite from every table it appears in. Index entries are
    /// only removed when they still point at this context, so a superseded
    /// invite never tears down its successor's entries.
    fn clear_context(&mut self, context: Context) -> Option<Invite> {
        let invite = self.invites.remove(&context)?;
        if self.inviters.get(&invite.inviter_id) == Some(&context) {
            self.inviters.remove(&invite.inviter_id);
        }
        if self.invitees.get(&invite.invitee_id) == Some(&context) {
            self.invitees.remove(&invite.invitee_id);
        }
        Some(invite)
    }
}

/// Coordinates friend-request negotiations. Cheap to clone; all fields are
/// shared.
#[derive(Clone)]
pub struct InviteCoordinator {
    tables: Arc<Mutex<InviteTables>>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn ObjectStore>,
    /// Pending delayed secret submissions, keyed by submitter. A newer
    /// submission replaces (aborts) the pending one.
    pending_secrets: Arc<DashMap<AvatarId, JoinHandle<()>>>,
    secret_delay: Duration,
}

impl InviteCoordinator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn ObjectStore>,
        config: &SocialConfig,
    ) -> Self {
        Self {
            tables: Arc::new(Mutex::new(InviteTables {
                invites: HashMap::new(),
                inviters: HashMap::new(),
                invitees: HashMap::new(),
                next_context: 0,
                declines: DeclineMemory::new(Duration::from_secs(config.decline_timeout_secs)),
            })),
            sessions,
            store,
            pending_secrets: Arc::new(DashMap::new()),
            secret_delay: Duration::from_millis(config.secret_delay_ms),
        }
    }

    // ── Inviter Messages ──────────────────────────────────────────────────

    /// Initiate a friendship request from `inviter_id` toward `invitee_id`.
    pub fn friend_query(&self, inviter_id: AvatarId, invitee_id: AvatarId) {
        if !self.sessions.is_online(invitee_id) {
            tracing::warn!(
                inviter = inviter_id,
                invitee = invitee_id,
                "Friend query for unregistered invitee"
            );
            return;
        }

        let mut tables = self.tables.lock();
        let context = tables.allocate_context();
        tables.invites.insert(
            context,
            Invite {
                context,
                inviter_id,
                invitee_id,
                invitee_notified: false,
                special_channel: false,
            },
        );
        tracing::debug!(inviter = inviter_id, invitee = invitee_id, context, "New invite");

        // A recent decline from this invitee suppresses the request without
        // bothering them; the remembered code is offset so the inviter can
        // tell it apart from a live answer.
        if let Some(previous) = tables.declines.lookup(invitee_id, inviter_id) {
            self.reject(&mut tables, context, ConsideringCode::remembered(previous));
            return;
        }

        // An invitee already being invited by someone else is busy.
        if tables.invitees.contains_key(&invitee_id) {
            self.reject(&mut tables, context, ConsideringCode::Busy);
            return;
        }

        if inviter_id == invitee_id {
            self.reject(&mut tables, context, ConsideringCode::SelfTarget);
            return;
        }

        // A newer invitation from the same inviter supersedes the old one.
        if let Some(prior) = tables.inviters.get(&inviter_id).copied() {
            if let Some(prior_invite) = tables.clear_context(prior) {
                tracing::debug!(inviter = inviter_id, superseded = prior, "Superseding prior invite");
                self.notify_cancel(&prior_invite);
            }
        }

        tables.inviters.insert(inviter_id, context);
        tables.invitees.insert(invitee_id, context);

        // Both participants resolvable: ask the invitee whether they can
        // consider a request at all. This is distinct from "do you accept".
        if let Some(profile) = self.sessions.profile(inviter_id) {
            if let Some(invite) = tables.invites.get_mut(&context) {
                invite.invitee_notified = true;
            }
            self.sessions.send_to(
                invitee_id,
                ServerMessage::InviteeFriendQuery {
                    inviter_id,
                    inviter_name: profile.name,
                    inviter_appearance: profile.appearance,
                    context,
                },
            );
        }
    }

    /// Cancel a pending friendship request. Unknown contexts are a silent
    /// no-op: clients legitimately race cancels against terminal events.
    pub fn cancel_friend_query(&self, sender: AvatarId, context: Context) {
        let invite = {
            let mut tables = self.tables.lock();
            match tables.invites.get(&context) {
                Some(invite) if invite.inviter_id == sender || invite.invitee_id == sender => {
                    tables.clear_context(context)
                }
                Some(_) => {
                    tracing::warn!(avatar = sender, context, "Cancel from non-participant");
                    None
                }
                None => {
                    tracing::debug!(avatar = sender, context, "Cancel for unknown context");
                    None
                }
            }
        };
        if let Some(invite) = invite {
            self.notify_cancel(&invite);
        }
    }

    // ── Invitee Messages ──────────────────────────────────────────────────

    /// The invitee's answer to the availability query.
    pub fn invitee_considering(&self, sender: AvatarId, code: AvailabilityCode, context: Context) {
        let mut tables = self.tables.lock();
        let Some(invite) = tables.invites.get(&context).cloned() else {
            tracing::warn!(avatar = sender, context, "Considering answer for unknown context");
            return;
        };
        if invite.invitee_id != sender {
            tracing::warn!(avatar = sender, context, "Considering answer from non-invitee");
            return;
        }

        match code.as_considering() {
            None => {
                // Available: the invitee is looking at the request. A
                // decision is expected next; the invite stays live.
                drop(tables);
                self.sessions.send_to(
                    invite.inviter_id,
                    ServerMessage::FriendConsidering {
                        code: ConsideringCode::Considering,
                        context,
                    },
                );
            }
            Some(reason) => self.reject(&mut tables, context, reason),
        }
    }

    /// The invitee's final answer, following an available considering reply.
    pub fn invitee_response(&self, sender: AvatarId, code: DecisionCode, context: Context) {
        let mut tables = self.tables.lock();
        let Some(invite) = tables.invites.get(&context).cloned() else {
            tracing::warn!(avatar = sender, context, "Decision for unknown context");
            return;
        };
        if invite.invitee_id != sender {
            tracing::warn!(avatar = sender, context, "Decision from non-invitee");
            return;
        }

        match code {
            DecisionCode::Accepted => {
                drop(tables);
                // Notify the inviter optimistically; the invite is only
                // cleared when the commit completion arrives for this
                // context.
                self.sessions.send_to(
                    invite.inviter_id,
                    ServerMessage::FriendResponse {
                        code: DecisionCode::Accepted,
                        context,
                    },
                );
                let coordinator = self.clone();
                tokio::spawn(async move {
                    let success = match coordinator
                        .store
                        .commit_friendship(invite.invitee_id, invite.inviter_id, 0)
                        .await
                    {
                        Ok(success) => success,
                        Err(error) => {
                            tracing::warn!(context, error = %error, "Friendship commit errored");
                            false
                        }
                    };
                    coordinator.commit_complete(context, success);
                });
            }
            code => {
                // An explicit no or a full friends list is memoized so the
                // same inviter cannot immediately ask again.
                if matches!(code, DecisionCode::Declined | DecisionCode::TooManyFriends) {
                    tables
                        .declines
                        .record(invite.invitee_id, invite.inviter_id, code);
                }
                tables.clear_context(context);
                drop(tables);
                self.sessions.send_to(
                    invite.inviter_id,
                    ServerMessage::FriendResponse { code, context },
                );
            }
        }
    }

    // ── Secret Code Side Channel ──────────────────────────────────────────

    /// Ask the store to issue a new secret for this avatar.
    pub fn request_secret(&self, avatar_id: AvatarId) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match coordinator.store.issue_secret(avatar_id).await {
                Ok(Some(secret)) => {
                    coordinator.sessions.send_to(
                        avatar_id,
                        ServerMessage::RequestSecretResponse {
                            code: RequestSecretCode::Success,
                            secret,
                        },
                    );
                }
                Ok(None) => {
                    coordinator.sessions.send_to(
                        avatar_id,
                        ServerMessage::RequestSecretResponse {
                            code: RequestSecretCode::TooManyOutstanding,
                            secret: String::new(),
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!(avatar = avatar_id, error = %error, "Secret issue failed");
                }
            }
        });
    }

    /// Submit a secret typed in by the user. The submission sits for a
    /// fixed delay before reaching the store, which makes guessing secrets
    /// at random slow; a resubmission from the same avatar replaces any
    /// pending one rather than queuing behind it.
    pub fn submit_secret(&self, avatar_id: AvatarId, secret: String) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(coordinator.secret_delay).await;
            coordinator.pending_secrets.remove(&avatar_id);
            // Once dispatched, the resolution runs to completion even if a
            // newer submission lands right now; only the delay is
            // replaceable.
            let dispatched = coordinator.clone();
            tokio::spawn(async move {
                dispatched.continue_submission(avatar_id, secret).await;
            });
        });
        if let Some((_, prior)) = self.pending_secrets.remove(&avatar_id) {
            prior.abort();
        }
        self.pending_secrets.insert(avatar_id, handle);
    }

    async fn continue_submission(&self, avatar_id: AvatarId, secret: String) {
        let resolution = match self.store.resolve_secret(avatar_id, &secret).await {
            Ok(resolution) => resolution,
            Err(error) => {
                tracing::warn!(avatar = avatar_id, error = %error, "Secret resolution failed");
                return;
            }
        };

        match resolution {
            SecretResolution::Unknown => {
                self.sessions.send_to(
                    avatar_id,
                    ServerMessage::SubmitSecretResponse {
                        code: SubmitSecretCode::Unknown,
                        avatar_id: 0,
                    },
                );
            }
            SecretResolution::SelfConsumed => {
                self.sessions.send_to(
                    avatar_id,
                    ServerMessage::SubmitSecretResponse {
                        code: SubmitSecretCode::SelfConsumed,
                        avatar_id: 0,
                    },
                );
            }
            SecretResolution::Matched(owner_id) => {
                // Same terminal action as a live accept, but the completion
                // is reported through the secret-response shape. The
                // synthesized invite has no pending client interaction, so
                // it lives in the context table only and neither blocks nor
                // is blocked by a live negotiation.
                let context = {
                    let mut tables = self.tables.lock();
                    let context = tables.allocate_context();
                    tables.invites.insert(
                        context,
                        Invite {
                            context,
                            inviter_id: avatar_id,
                            invitee_id: owner_id,
                            invitee_notified: false,
                            special_channel: true,
                        },
                    );
                    context
                };
                tracing::info!(
                    submitter = avatar_id,
                    owner = owner_id,
                    context,
                    "Secret matched, committing friendship"
                );
                let success = match self
                    .store
                    .commit_friendship(owner_id, avatar_id, 0)
                    .await
                {
                    Ok(success) => success,
                    Err(error) => {
                        tracing::warn!(context, error = %error, "Friendship commit errored");
                        false
                    }
                };
                self.commit_complete(context, success);
            }
        }
    }

    // ── Completion Handling ───────────────────────────────────────────────

    /// Completion of a friendship commit, matched back by context. Unknown
    /// contexts are accepted defensively: a cancel may have raced the
    /// commit, in which case the remaining notifications are suppressed.
    fn commit_complete(&self, context: Context, success: bool) {
        let invite = {
            let mut tables = self.tables.lock();
            tables.clear_context(context)
        };
        let Some(invite) = invite else {
            tracing::warn!(context, "Commit completion for unknown context");
            return;
        };

        if success {
            self.sessions
                .extend_friends(invite.inviter_id, invite.invitee_id);
            self.sessions
                .extend_friends(invite.invitee_id, invite.inviter_id);
            self.sessions.send_to(
                invite.inviter_id,
                ServerMessage::FriendOnline {
                    friend_id: invite.invitee_id,
                },
            );
            self.sessions.send_to(
                invite.invitee_id,
                ServerMessage::FriendOnline {
                    friend_id: invite.inviter_id,
                },
            );
        } else {
            tracing::warn!(
                context,
                inviter = invite.inviter_id,
                invitee = invite.invitee_id,
                "Friendship commit failed"
            );
        }

        if invite.special_channel {
            let code = if success {
                SubmitSecretCode::Success
            } else {
                SubmitSecretCode::TooManyFriends
            };
            self.sessions.send_to(
                invite.inviter_id,
                ServerMessage::SubmitSecretResponse {
                    code,
                    avatar_id: invite.invitee_id,
                },
            );
        }
    }

    // ── Support ───────────────────────────────────────────────────────────

    /// Terminal rejection of the availability phase: tell the inviter why
    /// and end the negotiation.
    fn reject(&self, tables: &mut InviteTables, context: Context, code: ConsideringCode) {
        if let Some(invite) = tables.clear_context(context) {
            self.sessions.send_to(
                invite.inviter_id,
                ServerMessage::FriendConsidering { code, context },
            );
        }
    }

    fn notify_cancel(&self, invite: &Invite) {
        if invite.invitee_notified {
            self.sessions.send_to(
                invite.invitee_id,
                ServerMessage::InviteeCancelFriendQuery {
                    context: invite.context,
                },
            );
        }
    }

    /// Number of invites currently live (for `/stats`).
    pub fn active_invites(&self) -> usize {
        self.tables.lock().invites.len()
    }

    /// Number of remembered declines across both generations (for `/stats`).
    pub fn remembered_declines(&self) -> usize {
        self.tables.lock().declines.len()
    }
}
