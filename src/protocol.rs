//! Coordination protocol message definitions.
//!
//! The server speaks a simple JSON-over-WebSocket protocol. Every message
//! carries a `type` tag; outcome codes are small closed integer sets, and a
//! code outside its set fails deserialization outright rather than being
//! silently ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque participant identifier. Zero is never a valid avatar.
pub type AvatarId = u32;

/// Correlation key for one invitation negotiation. Allocated monotonically,
/// never reused while the owning invite is live.
pub type Context = u32;

/// Offset added to a remembered decline code so the inviter can tell a
/// cached rejection apart from a live one of the same underlying reason.
pub const DECLINE_MEMORY_OFFSET: u8 = 10;

/// A code value outside its message's closed set.
#[derive(Debug, Error)]
#[error("unknown outcome code {0}")]
pub struct UnknownCode(pub u8);

// ── Outcome Codes ─────────────────────────────────────────────────────────────

/// The invitee's answer to "are you available to consider a request".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AvailabilityCode {
    /// Busy (in the middle of something the client won't interrupt).
    Busy,
    /// Available; a real decision will follow.
    Available,
    /// The invitee is ignoring the inviter.
    Ignoring,
    /// The invitee is not accepting friends at all.
    NotAccepting,
}

impl AvailabilityCode {
    /// The considering-result the inviter should see for an unavailable
    /// answer. `None` means the invitee is available (non-terminal).
    pub fn as_considering(self) -> Option<ConsideringCode> {
        match self {
            AvailabilityCode::Busy => Some(ConsideringCode::Busy),
            AvailabilityCode::Available => None,
            AvailabilityCode::Ignoring => Some(ConsideringCode::Ignored),
            AvailabilityCode::NotAccepting => Some(ConsideringCode::NotAccepting),
        }
    }
}

impl From<AvailabilityCode> for u8 {
    fn from(code: AvailabilityCode) -> u8 {
        match code {
            AvailabilityCode::Busy => 0,
            AvailabilityCode::Available => 1,
            AvailabilityCode::Ignoring => 4,
            AvailabilityCode::NotAccepting => 6,
        }
    }
}

impl TryFrom<u8> for AvailabilityCode {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(AvailabilityCode::Busy),
            1 => Ok(AvailabilityCode::Available),
            4 => Ok(AvailabilityCode::Ignoring),
            6 => Ok(AvailabilityCode::NotAccepting),
            other => Err(UnknownCode(other)),
        }
    }
}

/// Result of the availability phase, reported to the inviter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConsideringCode {
    /// The invitee is busy with another negotiation.
    Busy,
    /// The invitee is considering the request; a decision will follow.
    Considering,
    /// The invitee is already a friend.
    AlreadyFriends,
    /// The invitee is the inviter.
    SelfTarget,
    /// The invitee is ignoring the inviter.
    Ignored,
    /// The invitee is not accepting friends.
    NotAccepting,
    /// A recent decline is on record (remembered "no").
    RememberedDeclined,
    /// A recent decline is on record (remembered "too many friends").
    RememberedTooManyFriends,
}

impl ConsideringCode {
    /// Remembered-decline form of a cached decline code.
    pub fn remembered(code: DecisionCode) -> Self {
        match code {
            DecisionCode::TooManyFriends => ConsideringCode::RememberedTooManyFriends,
            _ => ConsideringCode::RememberedDeclined,
        }
    }
}

impl From<ConsideringCode> for u8 {
    fn from(code: ConsideringCode) -> u8 {
        match code {
            ConsideringCode::Busy => 0,
            ConsideringCode::Considering => 1,
            ConsideringCode::AlreadyFriends => 2,
            ConsideringCode::SelfTarget => 3,
            ConsideringCode::Ignored => 4,
            ConsideringCode::NotAccepting => 6,
            ConsideringCode::RememberedDeclined => DECLINE_MEMORY_OFFSET,
            ConsideringCode::RememberedTooManyFriends => 3 + DECLINE_MEMORY_OFFSET,
        }
    }
}

impl TryFrom<u8> for ConsideringCode {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(ConsideringCode::Busy),
            1 => Ok(ConsideringCode::Considering),
            2 => Ok(ConsideringCode::AlreadyFriends),
            3 => Ok(ConsideringCode::SelfTarget),
            4 => Ok(ConsideringCode::Ignored),
            6 => Ok(ConsideringCode::NotAccepting),
            10 => Ok(ConsideringCode::RememberedDeclined),
            13 => Ok(ConsideringCode::RememberedTooManyFriends),
            other => Err(UnknownCode(other)),
        }
    }
}

/// The invitee's final answer, and the result reported to the inviter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DecisionCode {
    /// Explicit no.
    Declined,
    /// Yes; a friendship commit follows.
    Accepted,
    /// Unable to answer (e.g. the invitee became busy mid-decision).
    Unable,
    /// The invitee's friends list is full.
    TooManyFriends,
}

impl From<DecisionCode> for u8 {
    fn from(code: DecisionCode) -> u8 {
        match code {
            DecisionCode::Declined => 0,
            DecisionCode::Accepted => 1,
            DecisionCode::Unable => 2,
            DecisionCode::TooManyFriends => 3,
        }
    }
}

impl TryFrom<u8> for DecisionCode {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(DecisionCode::Declined),
            1 => Ok(DecisionCode::Accepted),
            2 => Ok(DecisionCode::Unable),
            3 => Ok(DecisionCode::TooManyFriends),
            other => Err(UnknownCode(other)),
        }
    }
}

/// Result of a secret-code submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SubmitSecretCode {
    /// The secret is unknown or has expired.
    Unknown,
    /// Success; the submitter is now friends with the carried avatar id.
    Success,
    /// One of the avatars has too many friends already.
    TooManyFriends,
    /// The submitter consumed their own secret.
    SelfConsumed,
}

impl From<SubmitSecretCode> for u8 {
    fn from(code: SubmitSecretCode) -> u8 {
        match code {
            SubmitSecretCode::Unknown => 0,
            SubmitSecretCode::Success => 1,
            SubmitSecretCode::TooManyFriends => 2,
            SubmitSecretCode::SelfConsumed => 3,
        }
    }
}

impl TryFrom<u8> for SubmitSecretCode {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(SubmitSecretCode::Unknown),
            1 => Ok(SubmitSecretCode::Success),
            2 => Ok(SubmitSecretCode::TooManyFriends),
            3 => Ok(SubmitSecretCode::SelfConsumed),
            other => Err(UnknownCode(other)),
        }
    }
}

/// Result of a secret-code issue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestSecretCode {
    /// Too many secrets outstanding for this avatar. Try again later.
    TooManyOutstanding,
    /// Success; the new secret text is supplied.
    Success,
}

impl From<RequestSecretCode> for u8 {
    fn from(code: RequestSecretCode) -> u8 {
        match code {
            RequestSecretCode::TooManyOutstanding => 0,
            RequestSecretCode::Success => 1,
        }
    }
}

impl TryFrom<u8> for RequestSecretCode {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(RequestSecretCode::TooManyOutstanding),
            1 => Ok(RequestSecretCode::Success),
            other => Err(UnknownCode(other)),
        }
    }
}

// ── Client → Server ───────────────────────────────────────────────────────────

/// Messages sent from a client to the coordination server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register this connection with an avatar id and display attributes.
    /// Must be sent first after connecting. The sender identity is taken
    /// as pre-validated by the session layer in front of this server.
    Register {
        avatar_id: AvatarId,
        name: String,
        appearance: String,
    },

    /// Initiate a friendship request toward the given avatar.
    FriendQuery {
        invitee_id: AvatarId,
    },

    /// Cancel a pending friendship request. Canceling a context that has
    /// already resolved is a legitimate race and is silently ignored.
    CancelFriendQuery {
        context: Context,
    },

    /// Invitee's answer to the availability query.
    FriendConsidering {
        code: AvailabilityCode,
        context: Context,
    },

    /// Invitee's final answer, following an available considering reply.
    FriendResponse {
        code: DecisionCode,
        context: Context,
    },

    /// Ask the server to issue a new secret friend code.
    RequestSecret,

    /// Submit a secret friend code typed in by the user.
    SubmitSecret {
        secret: String,
    },

    /// Request the full friends list for the sending avatar.
    GetFriendsList,

    /// Request the packed details of one avatar or companion record.
    GetAvatarDetails {
        avatar_id: AvatarId,
    },

    /// Ping to keep the connection alive.
    Ping,
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Messages sent from the coordination server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful registration.
    Registered {
        avatar_id: AvatarId,
    },

    /// A friendship request from the indicated inviter. The invitee client
    /// should answer immediately with `FriendConsidering` to indicate
    /// whether it can consider the invitation right now.
    InviteeFriendQuery {
        inviter_id: AvatarId,
        inviter_name: String,
        inviter_appearance: String,
        context: Context,
    },

    /// The inviter rescinded a previous invitation.
    InviteeCancelFriendQuery {
        context: Context,
    },

    /// Whether the invitee is able to consider the request right now.
    FriendConsidering {
        code: ConsideringCode,
        context: Context,
    },

    /// The invitee's decision, following a considering reply.
    FriendResponse {
        code: DecisionCode,
        context: Context,
    },

    /// Response to `RequestSecret`. The secret text is empty on failure.
    RequestSecretResponse {
        code: RequestSecretCode,
        secret: String,
    },

    /// Response to `SubmitSecret`. On success the avatar id names the new
    /// friend; it is zero when no counterpart applies.
    SubmitSecretResponse {
        code: SubmitSecretCode,
        avatar_id: AvatarId,
    },

    /// The assembled friends list, sent exactly once per request.
    FriendsListResponse {
        friends: Vec<FriendSummary>,
    },

    /// A friend is currently online. Follows `FriendsListResponse`, and is
    /// also pushed to both sides when a friendship commit lands.
    FriendOnline {
        friend_id: AvatarId,
    },

    /// Response to `GetAvatarDetails`.
    AvatarDetailsResponse {
        avatar_id: AvatarId,
        success: bool,
        details: Option<RecordDetails>,
    },

    /// Error response.
    Error {
        message: String,
    },

    /// Pong response to keep the connection alive.
    Pong,
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// One entry of a friends-list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendSummary {
    pub avatar_id: AvatarId,
    pub name: String,
    pub appearance: String,
    pub companion_id: AvatarId,
}

/// Packed required fields of a resolved record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordDetails {
    Avatar {
        name: String,
        appearance: String,
        companion_id: AvatarId,
    },
    Companion {
        name: String,
        owner_id: AvatarId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_serialization() {
        let msg = ClientMessage::Register {
            avatar_id: 42,
            name: "Mossy".to_string(),
            appearance: "a1b2c3".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"register\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Register { avatar_id, name, .. } => {
                assert_eq!(avatar_id, 42);
                assert_eq!(name, "Mossy");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_friend_query_serialization() {
        let msg = ClientMessage::FriendQuery { invitee_id: 7 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"friend_query\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::FriendQuery { invitee_id } => assert_eq!(invitee_id, 7),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_considering_codes_are_numeric_on_the_wire() {
        let msg = ServerMessage::FriendConsidering {
            code: ConsideringCode::Busy,
            context: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":0"));

        let msg = ServerMessage::FriendConsidering {
            code: ConsideringCode::RememberedTooManyFriends,
            context: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":13"));
    }

    #[test]
    fn test_unknown_codes_fail_deserialization() {
        assert!(serde_json::from_str::<ConsideringCode>("5").is_err());
        assert!(serde_json::from_str::<ConsideringCode>("14").is_err());
        assert!(serde_json::from_str::<DecisionCode>("7").is_err());
        assert!(serde_json::from_str::<AvailabilityCode>("2").is_err());
        assert!(serde_json::from_str::<SubmitSecretCode>("9").is_err());
        assert!(serde_json::from_str::<RequestSecretCode>("2").is_err());
    }

    #[test]
    fn test_unknown_code_in_message_is_fatal() {
        let raw = r#"{"type":"friend_considering","code":9,"context":0}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_remembered_codes_carry_the_offset() {
        assert_eq!(
            u8::from(ConsideringCode::remembered(DecisionCode::Declined)),
            DECLINE_MEMORY_OFFSET
        );
        assert_eq!(
            u8::from(ConsideringCode::remembered(DecisionCode::TooManyFriends)),
            3 + DECLINE_MEMORY_OFFSET
        );
    }

    #[test]
    fn test_availability_maps_to_considering() {
        assert_eq!(AvailabilityCode::Available.as_considering(), None);
        assert_eq!(
            AvailabilityCode::Busy.as_considering(),
            Some(ConsideringCode::Busy)
        );
        assert_eq!(
            AvailabilityCode::Ignoring.as_considering(),
            Some(ConsideringCode::Ignored)
        );
        assert_eq!(
            AvailabilityCode::NotAccepting.as_considering(),
            Some(ConsideringCode::NotAccepting)
        );
    }

    #[test]
    fn test_all_client_message_variants_round_trip() {
        let messages = vec![
            ClientMessage::Register {
                avatar_id: 1,
                name: "Mossy".to_string(),
                appearance: "aa".to_string(),
            },
            ClientMessage::FriendQuery { invitee_id: 2 },
            ClientMessage::CancelFriendQuery { context: 0 },
            ClientMessage::FriendConsidering {
                code: AvailabilityCode::Available,
                context: 0,
            },
            ClientMessage::FriendResponse {
                code: DecisionCode::Accepted,
                context: 0,
            },
            ClientMessage::RequestSecret,
            ClientMessage::SubmitSecret {
                secret: "kp3wzn".to_string(),
            },
            ClientMessage::GetFriendsList,
            ClientMessage::GetAvatarDetails { avatar_id: 2 },
            ClientMessage::Ping,
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn test_all_server_message_variants_round_trip() {
        let messages = vec![
            ServerMessage::Registered { avatar_id: 1 },
            ServerMessage::InviteeFriendQuery {
                inviter_id: 1,
                inviter_name: "Mossy".to_string(),
                inviter_appearance: "aa".to_string(),
                context: 0,
            },
            ServerMessage::InviteeCancelFriendQuery { context: 0 },
            ServerMessage::FriendConsidering {
                code: ConsideringCode::Considering,
                context: 0,
            },
            ServerMessage::FriendResponse {
                code: DecisionCode::Declined,
                context: 0,
            },
            ServerMessage::RequestSecretResponse {
                code: RequestSecretCode::Success,
                secret: "kp3wzn".to_string(),
            },
            ServerMessage::SubmitSecretResponse {
                code: SubmitSecretCode::Success,
                avatar_id: 2,
            },
            ServerMessage::FriendsListResponse {
                friends: vec![FriendSummary {
                    avatar_id: 2,
                    name: "Briar".to_string(),
                    appearance: "bb".to_string(),
                    companion_id: 0,
                }],
            },
            ServerMessage::FriendOnline { friend_id: 2 },
            ServerMessage::AvatarDetailsResponse {
                avatar_id: 2,
                success: true,
                details: Some(RecordDetails::Avatar {
                    name: "Briar".to_string(),
                    appearance: "bb".to_string(),
                    companion_id: 9,
                }),
            },
            ServerMessage::Error {
                message: "nope".to_string(),
            },
            ServerMessage::Pong,
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2, "Round-trip failed for: {}", json);
        }
    }

    #[test]
    fn test_record_details_tagging() {
        let details = RecordDetails::Companion {
            name: "Acorn".to_string(),
            owner_id: 1,
        };
        let json = serde_json::to_string(&details).unwrap();
        assert!(json.contains("\"kind\":\"companion\""));
    }
}
