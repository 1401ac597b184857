//! Domain documents persisted by the store.
//!
//! A [`Chat`] is kept as a single JSON document and mutated by
//! read-modify-write inside one transaction. Messages, reactions,
//! per-viewer deletions and audit events are row-level so that concurrent
//! writers on the same message never overwrite each other.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use huddle_shared::crypto::SealedText;
use huddle_shared::types::{AttachmentRef, AuditEventId, ChatId, ChatKind, MessageId, UserId};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A one-directional block inside a direct chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub by: UserId,
    pub target: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: UserId,
    pub requested_at: DateTime<Utc>,
}

/// Denormalized preview of the newest message, used for chat listings.
/// The text stays sealed at rest like the message itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: MessageId,
    pub text: Option<SealedText>,
    pub sender: UserId,
    pub created_at: DateTime<Utc>,
}

/// A direct or group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    /// Group only.
    pub title: Option<String>,
    pub created_by: UserId,
    pub participants: BTreeSet<UserId>,
    pub admins: BTreeSet<UserId>,
    /// Former group members who keep read access to the history.
    #[serde(default)]
    pub removed_participants: BTreeSet<UserId>,
    /// Direct only.
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub join_requests: Vec<JoinRequest>,
    pub mute_until: Option<DateTime<Utc>>,
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub read_state: BTreeMap<UserId, DateTime<Utc>>,
    pub last_message: Option<LastMessage>,
    /// Most recent pin last.
    #[serde(default)]
    pub pinned_message_ids: Vec<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new_direct(a: UserId, b: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: ChatId::new(),
            kind: ChatKind::Direct,
            title: None,
            created_by: a,
            participants: BTreeSet::from([a, b]),
            admins: BTreeSet::new(),
            removed_participants: BTreeSet::new(),
            blocks: Vec::new(),
            join_requests: Vec::new(),
            mute_until: None,
            rate_limit_per_minute: None,
            read_state: BTreeMap::new(),
            last_message: None,
            pinned_message_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_group(
        creator: UserId,
        title: String,
        members: impl IntoIterator<Item = UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut participants: BTreeSet<UserId> = members.into_iter().collect();
        participants.insert(creator);
        Self {
            id: ChatId::new(),
            kind: ChatKind::Group,
            title: Some(title),
            created_by: creator,
            participants,
            admins: BTreeSet::from([creator]),
            removed_participants: BTreeSet::new(),
            blocks: Vec::new(),
            join_requests: Vec::new(),
            mute_until: None,
            rate_limit_per_minute: None,
            read_state: BTreeMap::new(),
            last_message: None,
            pinned_message_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Uniqueness key of a direct chat: the unordered participant pair.
    pub fn direct_key(a: &UserId, b: &UserId) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("{lo}:{hi}")
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ChatKind::Direct
    }

    pub fn is_group(&self) -> bool {
        self.kind == ChatKind::Group
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    pub fn is_removed(&self, user: &UserId) -> bool {
        self.removed_participants.contains(user)
    }

    /// Creator or admin of a group who is still a participant. Removed admins
    /// lose their rights by absence from `participants`.
    pub fn is_manager(&self, user: &UserId) -> bool {
        self.is_group()
            && self.is_participant(user)
            && (self.created_by == *user || self.admins.contains(user))
    }

    /// The other side of a direct chat.
    pub fn counterpart(&self, user: &UserId) -> Option<UserId> {
        if !self.is_direct() {
            return None;
        }
        self.participants.iter().copied().find(|p| p != user)
    }

    pub fn has_block(&self, by: &UserId, target: &UserId) -> bool {
        self.blocks.iter().any(|b| b.by == *by && b.target == *target)
    }

    /// A block in either direction between `a` and `b`.
    pub fn blocked_between(&self, a: &UserId, b: &UserId) -> bool {
        self.has_block(a, b) || self.has_block(b, a)
    }

    pub fn active_mute(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.mute_until.filter(|until| *until > now)
    }

    pub fn has_join_request(&self, user: &UserId) -> bool {
        self.join_requests.iter().any(|r| r.user_id == *user)
    }

    pub fn last_read_at(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.read_state.get(user).copied()
    }

    /// Move the reader's marker forward; never backwards.
    pub fn advance_read_state(&mut self, user: UserId, at: DateTime<Utc>) {
        let entry = self.read_state.entry(user).or_insert(at);
        if *entry < at {
            *entry = at;
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. The text is only ever stored sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// `None` for attachment-only messages.
    pub sealed: Option<SealedText>,
    pub created_at: DateTime<Utc>,
    pub mentions: Vec<UserId>,
    pub attachments: Vec<AttachmentRef>,
    pub deleted_for_all: bool,
    pub deleted_by: Option<UserId>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Insertion sequence, the tie-break for equal `created_at`.
    pub seq: i64,
}

/// Fields supplied by the writer; the store assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sealed: Option<SealedText>,
    pub created_at: DateTime<Utc>,
    pub mentions: Vec<UserId>,
    pub attachments: Vec<AttachmentRef>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    #[serde(rename = "participant.added")]
    ParticipantAdded,
    #[serde(rename = "participant.removed")]
    ParticipantRemoved,
    #[serde(rename = "chat.renamed")]
    ChatRenamed,
    #[serde(rename = "join.requested")]
    JoinRequested,
    #[serde(rename = "join.approved")]
    JoinApproved,
    #[serde(rename = "join.rejected")]
    JoinRejected,
    #[serde(rename = "mute.set")]
    MuteSet,
    #[serde(rename = "mute.cleared")]
    MuteCleared,
    #[serde(rename = "rateLimit.set")]
    RateLimitSet,
    #[serde(rename = "rateLimit.cleared")]
    RateLimitCleared,
    #[serde(rename = "pin.added")]
    PinAdded,
    #[serde(rename = "pin.removed")]
    PinRemoved,
    #[serde(rename = "message.deletedForAll")]
    MessageDeletedForAll,
    #[serde(rename = "user.blocked")]
    UserBlocked,
    #[serde(rename = "user.unblocked")]
    UserUnblocked,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ParticipantAdded => "participant.added",
            AuditKind::ParticipantRemoved => "participant.removed",
            AuditKind::ChatRenamed => "chat.renamed",
            AuditKind::JoinRequested => "join.requested",
            AuditKind::JoinApproved => "join.approved",
            AuditKind::JoinRejected => "join.rejected",
            AuditKind::MuteSet => "mute.set",
            AuditKind::MuteCleared => "mute.cleared",
            AuditKind::RateLimitSet => "rateLimit.set",
            AuditKind::RateLimitCleared => "rateLimit.cleared",
            AuditKind::PinAdded => "pin.added",
            AuditKind::PinRemoved => "pin.removed",
            AuditKind::MessageDeletedForAll => "message.deletedForAll",
            AuditKind::UserBlocked => "user.blocked",
            AuditKind::UserUnblocked => "user.unblocked",
        }
    }
}

/// An immutable moderation record, stored apart from the chat document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: AuditEventId,
    pub chat_id: ChatId,
    pub actor_id: UserId,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        chat_id: ChatId,
        actor_id: UserId,
        kind: AuditKind,
        meta: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditEventId::new(),
            chat_id,
            actor_id,
            kind,
            meta,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_key_is_unordered() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(Chat::direct_key(&a, &b), Chat::direct_key(&b, &a));
    }

    #[test]
    fn test_block_is_directional_in_record() {
        let a = UserId::new();
        let b = UserId::new();
        let mut chat = Chat::new_direct(a, b, Utc::now());
        chat.blocks.push(Block { by: a, target: b });

        assert!(chat.has_block(&a, &b));
        assert!(!chat.has_block(&b, &a));
        assert!(chat.blocked_between(&b, &a));
    }

    #[test]
    fn test_removed_admin_is_not_manager() {
        let creator = UserId::new();
        let admin = UserId::new();
        let mut chat = Chat::new_group(creator, "Ops".into(), [admin], Utc::now());
        chat.admins.insert(admin);
        assert!(chat.is_manager(&admin));

        chat.participants.remove(&admin);
        chat.removed_participants.insert(admin);
        assert!(!chat.is_manager(&admin));
        assert!(chat.is_manager(&creator));
    }

    #[test]
    fn test_read_state_never_moves_backwards() {
        let user = UserId::new();
        let mut chat = Chat::new_direct(user, UserId::new(), Utc::now());
        let later = Utc::now() + chrono::Duration::seconds(10);

        chat.advance_read_state(user, later);
        chat.advance_read_state(user, later - chrono::Duration::seconds(5));
        assert_eq!(chat.last_read_at(&user), Some(later));
    }

    #[test]
    fn test_chat_document_round_trip() {
        let mut chat = Chat::new_group(UserId::new(), "Night shift".into(), [UserId::new()], Utc::now());
        chat.read_state.insert(chat.created_by, Utc::now());
        let json = serde_json::to_string(&chat).unwrap();
        let back: Chat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chat);
    }
}
