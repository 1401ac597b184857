//! Chat Directory: chat entities, membership, blocks, moderation settings and
//! join requests.
//!
//! Every mutation is a load-modify-save of the chat document inside one store
//! write transaction, together with the audit record it produces.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use huddle_shared::clock::Clock;
use huddle_shared::constants::{MAX_TITLE_CHARS, RATE_LIMIT_WINDOW_SECS};
use huddle_shared::crypto::{DecryptionContext, EncryptionGateway};
use huddle_shared::types::{ChatId, ChatKind, MessageId, UserId};
use huddle_shared::{ChatError, ChatResult};
use huddle_store::{AuditEvent, AuditKind, Block, Chat, Database, JoinRequest, Tx};

/// Current participants and former group members may read a chat.
pub fn authorize_read(chat: &Chat, viewer: &UserId) -> ChatResult<()> {
    if chat.is_participant(viewer) || chat.is_removed(viewer) {
        Ok(())
    } else {
        Err(ChatError::forbidden("Not authorized for this chat"))
    }
}

/// Membership, then blocks, then mute, then the per-minute rate limit.
pub fn authorize_send(
    tx: &Tx<'_>,
    chat: &Chat,
    sender: &UserId,
    now: DateTime<Utc>,
) -> ChatResult<()> {
    if !chat.is_participant(sender) {
        return Err(ChatError::forbidden("Not a participant of this chat"));
    }

    if chat.is_direct() {
        if let Some(other) = chat.counterpart(sender) {
            if chat.blocked_between(sender, &other) {
                return Err(ChatError::forbidden("blocked"));
            }
        }
    }

    if chat.is_group() && chat.active_mute(now).is_some() && !chat.is_manager(sender) {
        return Err(ChatError::forbidden("muted"));
    }

    if let Some(limit) = chat.rate_limit_per_minute {
        let since = now - Duration::seconds(RATE_LIMIT_WINDOW_SECS);
        let recent = tx.count_messages_since(&chat.id, sender, &since)?;
        if recent >= limit {
            return Err(ChatError::RateLimited { limit });
        }
    }

    Ok(())
}

pub(crate) fn load_chat(tx: &Tx<'_>, id: &ChatId) -> ChatResult<Chat> {
    tx.find_chat(id)?
        .ok_or_else(|| ChatError::not_found("Chat not found"))
}

pub(crate) fn record_audit(
    tx: &Tx<'_>,
    chat: &Chat,
    actor: &UserId,
    kind: AuditKind,
    meta: serde_json::Value,
    now: DateTime<Utc>,
) -> ChatResult<()> {
    tx.append_audit(&AuditEvent::new(chat.id, *actor, kind, meta, now))?;
    debug!(chat = %chat.id, actor = %actor, kind = kind.as_str(), "Audit event recorded");
    Ok(())
}

fn require_group(chat: &Chat) -> ChatResult<()> {
    if chat.is_group() {
        Ok(())
    } else {
        Err(ChatError::invalid("Operation is only available for group chats"))
    }
}

fn require_manager(chat: &Chat, actor: &UserId) -> ChatResult<()> {
    require_group(chat)?;
    if chat.is_manager(actor) {
        Ok(())
    } else {
        Err(ChatError::forbidden("Only the group creator or admins can do this"))
    }
}

fn validate_title(raw: &str) -> ChatResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ChatError::invalid("Title is required"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ChatError::invalid(format!(
            "Title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageView {
    pub message_id: MessageId,
    pub text: Option<String>,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
}

/// A chat as one viewer sees it in listings and responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub title: Option<String>,
    pub created_by: UserId,
    pub participants: Vec<UserId>,
    pub admins: Vec<UserId>,
    pub removed_participants: Vec<UserId>,
    pub blocks: Vec<Block>,
    pub join_requests: Vec<JoinRequest>,
    pub mute_until: Option<DateTime<Utc>>,
    pub rate_limit_per_minute: Option<u32>,
    pub last_message: Option<LastMessageView>,
    pub pinned_message_ids: Vec<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub can_manage: bool,
}

/// A group as listed to any user, member or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListing {
    pub id: ChatId,
    pub title: Option<String>,
    pub participant_count: usize,
    pub is_member: bool,
    pub has_pending_request: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

pub struct ChatDirectory {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn EncryptionGateway>,
}

impl ChatDirectory {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, gateway: Arc<dyn EncryptionGateway>) -> Self {
        Self { db, clock, gateway }
    }

    /// Return the direct chat of the unordered pair, creating it on first
    /// contact. The flag is `true` when this call created it.
    pub fn get_or_create_direct_chat(&self, user: UserId, other: Option<UserId>) -> ChatResult<(Chat, bool)> {
        let other = other.ok_or_else(|| ChatError::invalid("otherUserId is required"))?;
        if other == user {
            return Err(ChatError::invalid("Cannot start a direct chat with yourself"));
        }

        let now = self.clock.now();
        self.db.write(|tx| {
            if let Some(existing) = tx.find_direct_chat(&user, &other)? {
                return Ok((existing, false));
            }

            let chat = Chat::new_direct(user, other, now);
            tx.insert_chat(&chat)?;
            info!(chat = %chat.id, user = %user, other = %other, "Direct chat created");
            Ok((chat, true))
        })
    }

    pub fn create_group_chat(
        &self,
        creator: UserId,
        title: &str,
        participant_ids: &[UserId],
    ) -> ChatResult<Chat> {
        let title = validate_title(title)?;
        let others: BTreeSet<UserId> = participant_ids
            .iter()
            .copied()
            .filter(|id| *id != creator)
            .collect();
        if others.is_empty() {
            return Err(ChatError::invalid("A group needs at least one other participant"));
        }

        let chat = Chat::new_group(creator, title, others, self.clock.now());
        self.db.write(|tx| tx.insert_chat(&chat).map_err(ChatError::from))?;

        info!(
            chat = %chat.id,
            creator = %creator,
            participants = chat.participants.len(),
            "Group chat created"
        );
        Ok(chat)
    }

    pub fn load(&self, chat_id: &ChatId) -> ChatResult<Chat> {
        self.db.read(|tx| load_chat(tx, chat_id))
    }

    /// Chats where `user` is a current participant.
    pub fn participating_chat_ids(&self, user: &UserId) -> ChatResult<Vec<ChatId>> {
        self.db.read(|tx| tx.participating_chat_ids(user).map_err(ChatError::from))
    }

    pub fn add_participant(&self, chat_id: &ChatId, actor: UserId, user: UserId) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_manager(&chat, &actor)?;
            if chat.is_participant(&user) {
                return Ok(chat);
            }

            chat.participants.insert(user);
            chat.removed_participants.remove(&user);
            chat.join_requests.retain(|r| r.user_id != user);
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &actor, AuditKind::ParticipantAdded, json!({ "userId": user }), now)?;

            info!(chat = %chat.id, actor = %actor, user = %user, "Participant added");
            Ok(chat)
        })
    }

    /// Remove a participant, or leave when `actor == target`. History stays
    /// readable to the removed user.
    pub fn remove_participant(&self, chat_id: &ChatId, actor: UserId, target: UserId) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_group(&chat)?;

            let leaving = actor == target;
            if !leaving {
                require_manager(&chat, &actor)?;
            }
            if target == chat.created_by {
                return Err(ChatError::forbidden("The group creator cannot be removed"));
            }
            if !chat.is_participant(&target) {
                return Err(ChatError::not_found("User is not a participant of this chat"));
            }

            chat.participants.remove(&target);
            chat.removed_participants.insert(target);
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(
                tx,
                &chat,
                &actor,
                AuditKind::ParticipantRemoved,
                json!({ "userId": target, "left": leaving }),
                now,
            )?;

            info!(chat = %chat.id, actor = %actor, user = %target, leaving, "Participant removed");
            Ok(chat)
        })
    }

    pub fn rename(&self, chat_id: &ChatId, actor: UserId, title: &str) -> ChatResult<Chat> {
        let title = validate_title(title)?;
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_manager(&chat, &actor)?;

            let previous = chat.title.replace(title.clone());
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(
                tx,
                &chat,
                &actor,
                AuditKind::ChatRenamed,
                json!({ "from": previous, "to": title }),
                now,
            )?;
            Ok(chat)
        })
    }

    /// Ask to join a group. Returns `false` if a request was already pending.
    pub fn request_join(&self, chat_id: &ChatId, user: UserId) -> ChatResult<bool> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_group(&chat)?;
            if chat.is_participant(&user) {
                return Err(ChatError::Conflict("Already a participant of this chat".into()));
            }
            if chat.has_join_request(&user) {
                return Ok(false);
            }

            chat.join_requests.push(JoinRequest {
                user_id: user,
                requested_at: now,
            });
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &user, AuditKind::JoinRequested, json!({ "userId": user }), now)?;
            Ok(true)
        })
    }

    pub fn approve_request(&self, chat_id: &ChatId, actor: UserId, user: UserId) -> ChatResult<Chat> {
        self.resolve_request(chat_id, actor, user, true)
    }

    pub fn reject_request(&self, chat_id: &ChatId, actor: UserId, user: UserId) -> ChatResult<Chat> {
        self.resolve_request(chat_id, actor, user, false)
    }

    fn resolve_request(&self, chat_id: &ChatId, actor: UserId, user: UserId, approve: bool) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_manager(&chat, &actor)?;
            if !chat.has_join_request(&user) {
                return Err(ChatError::not_found("No pending join request for this user"));
            }

            chat.join_requests.retain(|r| r.user_id != user);
            let kind = if approve {
                chat.participants.insert(user);
                chat.removed_participants.remove(&user);
                AuditKind::JoinApproved
            } else {
                AuditKind::JoinRejected
            };
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &actor, kind, json!({ "userId": user }), now)?;

            info!(chat = %chat.id, actor = %actor, user = %user, approve, "Join request resolved");
            Ok(chat)
        })
    }

    /// Block the other side of a direct chat. Blocking twice is a no-op.
    pub fn block_user(&self, chat_id: &ChatId, actor: UserId) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            let target = direct_counterpart(&chat, &actor)?;
            if chat.has_block(&actor, &target) {
                return Ok(chat);
            }

            chat.blocks.push(Block { by: actor, target });
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &actor, AuditKind::UserBlocked, json!({ "target": target }), now)?;
            Ok(chat)
        })
    }

    /// Lift the caller's own block. Unblocking without a block is a no-op.
    pub fn unblock_user(&self, chat_id: &ChatId, actor: UserId) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            let target = direct_counterpart(&chat, &actor)?;
            if !chat.has_block(&actor, &target) {
                return Ok(chat);
            }

            chat.blocks.retain(|b| !(b.by == actor && b.target == target));
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &actor, AuditKind::UserUnblocked, json!({ "target": target }), now)?;
            Ok(chat)
        })
    }

    /// Suspend sending for non-admins until `until`, or lift the mute.
    pub fn set_mute(&self, chat_id: &ChatId, actor: UserId, until: Option<DateTime<Utc>>) -> ChatResult<Chat> {
        let now = self.clock.now();
        if until.is_some_and(|u| u <= now) {
            return Err(ChatError::invalid("Mute end must be in the future"));
        }

        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_manager(&chat, &actor)?;

            chat.mute_until = until;
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            match until {
                Some(until) => {
                    record_audit(tx, &chat, &actor, AuditKind::MuteSet, json!({ "until": until }), now)?
                }
                None => record_audit(tx, &chat, &actor, AuditKind::MuteCleared, json!({}), now)?,
            }
            Ok(chat)
        })
    }

    pub fn set_rate_limit(&self, chat_id: &ChatId, actor: UserId, per_minute: Option<u32>) -> ChatResult<Chat> {
        if per_minute == Some(0) {
            return Err(ChatError::invalid("Rate limit must be at least 1 message per minute"));
        }

        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            require_manager(&chat, &actor)?;

            chat.rate_limit_per_minute = per_minute;
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            match per_minute {
                Some(limit) => record_audit(
                    tx,
                    &chat,
                    &actor,
                    AuditKind::RateLimitSet,
                    json!({ "perMinute": limit }),
                    now,
                )?,
                None => record_audit(tx, &chat, &actor, AuditKind::RateLimitCleared, json!({}), now)?,
            }
            Ok(chat)
        })
    }

    /// Move the caller's read marker to now.
    pub fn mark_read(&self, chat_id: &ChatId, user: UserId) -> ChatResult<DateTime<Utc>> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            authorize_read(&chat, &user)?;

            chat.advance_read_state(user, now);
            tx.save_chat(&chat)?;
            Ok(chat.last_read_at(&user).unwrap_or(now))
        })
    }

    /// The caller's chats, most recently active first.
    pub fn list_chats(&self, user: &UserId) -> ChatResult<Vec<ChatView>> {
        self.db.read(|tx| {
            tx.list_chats_for_user(user)?
                .iter()
                .map(|chat| self.view_in(tx, chat, user))
                .collect()
        })
    }

    /// Every group, flagged with the caller's relation to it.
    pub fn list_groups(&self, user: &UserId) -> ChatResult<Vec<GroupListing>> {
        let groups = self.db.read(|tx| tx.list_group_chats().map_err(ChatError::from))?;
        Ok(groups
            .into_iter()
            .map(|chat| GroupListing {
                id: chat.id,
                participant_count: chat.participants.len(),
                is_member: chat.is_participant(user),
                has_pending_request: chat.has_join_request(user),
                updated_at: chat.updated_at,
                title: chat.title,
            })
            .collect())
    }

    pub fn group_details(&self, chat_id: &ChatId, user: &UserId) -> ChatResult<ChatView> {
        self.db.read(|tx| {
            let chat = load_chat(tx, chat_id)?;
            authorize_read(&chat, user)?;
            self.view_in(tx, &chat, user)
        })
    }

    /// Audit events of a chat, oldest first. Group managers only; either
    /// participant of a direct chat.
    pub fn audit_log(&self, chat_id: &ChatId, user: &UserId) -> ChatResult<Vec<AuditEvent>> {
        self.db.read(|tx| {
            let chat = load_chat(tx, chat_id)?;
            let allowed = match chat.kind {
                ChatKind::Direct => chat.is_participant(user),
                ChatKind::Group => chat.is_manager(user),
            };
            if !allowed {
                return Err(ChatError::forbidden("Only chat admins can view the audit log"));
            }
            Ok(tx.list_audit(chat_id)?)
        })
    }

    pub fn view(&self, chat: &Chat, viewer: &UserId) -> ChatResult<ChatView> {
        self.db.read(|tx| self.view_in(tx, chat, viewer))
    }

    fn view_in(&self, tx: &Tx<'_>, chat: &Chat, viewer: &UserId) -> ChatResult<ChatView> {
        let last_read_at = chat.last_read_at(viewer);
        let unread_count = tx.count_unread(&chat.id, viewer, last_read_at.as_ref())?;

        let last_message = match &chat.last_message {
            Some(last) => {
                let hidden = tx.is_hidden_for(&last.message_id, viewer)?;
                let text = match (&last.text, hidden) {
                    (Some(sealed), false) => {
                        let ctx = DecryptionContext {
                            chat_id: chat.id,
                            viewer_id: *viewer,
                        };
                        match self.gateway.decrypt(sealed, &ctx) {
                            Ok(text) => Some(text),
                            Err(e) => {
                                warn!(chat = %chat.id, viewer = %viewer, error = %e, "Cannot open last message preview");
                                None
                            }
                        }
                    }
                    _ => None,
                };
                Some(LastMessageView {
                    message_id: last.message_id,
                    text,
                    sender_id: last.sender,
                    created_at: last.created_at,
                })
            }
            None => None,
        };

        Ok(ChatView {
            id: chat.id,
            kind: chat.kind,
            title: chat.title.clone(),
            created_by: chat.created_by,
            participants: chat.participants.iter().copied().collect(),
            admins: chat.admins.iter().copied().collect(),
            removed_participants: chat.removed_participants.iter().copied().collect(),
            blocks: chat.blocks.clone(),
            join_requests: chat.join_requests.clone(),
            mute_until: chat.mute_until,
            rate_limit_per_minute: chat.rate_limit_per_minute,
            last_message,
            pinned_message_ids: chat.pinned_message_ids.clone(),
            created_at: chat.created_at,
            updated_at: chat.updated_at,
            last_read_at,
            unread_count,
            can_manage: chat.is_manager(viewer),
        })
    }
}

fn direct_counterpart(chat: &Chat, actor: &UserId) -> ChatResult<UserId> {
    if !chat.is_direct() {
        return Err(ChatError::invalid("Blocking is only available in direct chats"));
    }
    if !chat.is_participant(actor) {
        return Err(ChatError::forbidden("Not a participant of this chat"));
    }
    chat.counterpart(actor)
        .ok_or_else(|| ChatError::Internal(format!("direct chat {} has no counterpart", chat.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[test]
    fn test_direct_chat_is_symmetric_and_idempotent() {
        let fx = Fixture::new();
        let a = UserId::new();
        let b = UserId::new();

        let (ab, created) = fx.directory.get_or_create_direct_chat(a, Some(b)).unwrap();
        assert!(created);
        let (ba, created_ba) = fx.directory.get_or_create_direct_chat(b, Some(a)).unwrap();
        let (again, created_again) = fx.directory.get_or_create_direct_chat(a, Some(b)).unwrap();

        assert!(!created_ba && !created_again);
        assert_eq!(ab.id, ba.id);
        assert_eq!(ab.id, again.id);
        assert_eq!(ab.participants.len(), 2);
    }

    #[test]
    fn test_direct_chat_rejects_missing_or_self() {
        let fx = Fixture::new();
        let a = UserId::new();

        let missing = fx.directory.get_or_create_direct_chat(a, None).unwrap_err();
        assert!(matches!(missing, ChatError::InvalidRequest(_)));
        let own = fx.directory.get_or_create_direct_chat(a, Some(a)).unwrap_err();
        assert!(matches!(own, ChatError::InvalidRequest(_)));
    }

    #[test]
    fn test_group_creation_validates_input() {
        let fx = Fixture::new();
        let creator = UserId::new();

        let empty_title = fx.directory.create_group_chat(creator, "   ", &[UserId::new()]);
        assert!(matches!(empty_title, Err(ChatError::InvalidRequest(_))));

        let alone = fx.directory.create_group_chat(creator, "Solo", &[creator]);
        assert!(matches!(alone, Err(ChatError::InvalidRequest(_))));

        let chat = fx
            .directory
            .create_group_chat(creator, "  Radiology  ", &[UserId::new()])
            .unwrap();
        assert_eq!(chat.title.as_deref(), Some("Radiology"));
        assert!(chat.is_manager(&creator));
        assert_eq!(chat.participants.len(), 2);
    }

    #[test]
    fn test_removed_member_reads_but_cannot_send() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();

        let chat = fx.directory.remove_participant(&chat.id, creator, member).unwrap();
        assert!(authorize_read(&chat, &member).is_ok());

        let err = fx
            .db
            .read(|tx| authorize_send(tx, &chat, &member, fx.clock.now()))
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn test_membership_changes_require_manager() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();

        let err = fx.directory.add_participant(&chat.id, member, UserId::new()).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        let err = fx.directory.rename(&chat.id, member, "Mine").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        let err = fx.directory.remove_participant(&chat.id, creator, creator).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn test_member_can_leave() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();

        let chat = fx.directory.remove_participant(&chat.id, member, member).unwrap();
        assert!(!chat.is_participant(&member));
        assert!(chat.is_removed(&member));

        let err = fx.directory.remove_participant(&chat.id, member, member).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_join_request_lifecycle() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let outsider = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();

        assert!(fx.directory.request_join(&chat.id, outsider).unwrap());
        assert!(!fx.directory.request_join(&chat.id, outsider).unwrap());
        let err = fx.directory.request_join(&chat.id, member).unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));

        let groups = fx.directory.list_groups(&outsider).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].is_member);
        assert!(groups[0].has_pending_request);

        let err = fx.directory.approve_request(&chat.id, member, outsider).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let chat = fx.directory.approve_request(&chat.id, creator, outsider).unwrap();
        assert!(chat.is_participant(&outsider));
        assert!(chat.join_requests.is_empty());

        let err = fx.directory.reject_request(&chat.id, creator, outsider).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_block_is_commutative_in_effect_not_in_record() {
        let fx = Fixture::new();
        let a = UserId::new();
        let b = UserId::new();
        let (chat, _) = fx.directory.get_or_create_direct_chat(a, Some(b)).unwrap();

        let chat = fx.directory.block_user(&chat.id, a).unwrap();
        let chat = fx.directory.block_user(&chat.id, a).unwrap();
        assert_eq!(chat.blocks.len(), 1);

        let now = fx.clock.now();
        let a_send = fx.db.read(|tx| authorize_send(tx, &chat, &a, now)).unwrap_err();
        let b_send = fx.db.read(|tx| authorize_send(tx, &chat, &b, now)).unwrap_err();
        assert_eq!(a_send, ChatError::forbidden("blocked"));
        assert_eq!(b_send, ChatError::forbidden("blocked"));

        // Only the blocker can lift their own block.
        let chat = fx.directory.unblock_user(&chat.id, b).unwrap();
        assert_eq!(chat.blocks.len(), 1);
        let chat = fx.directory.unblock_user(&chat.id, a).unwrap();
        assert!(chat.blocks.is_empty());
        assert!(fx.db.read(|tx| authorize_send(tx, &chat, &b, now)).is_ok());
    }

    #[test]
    fn test_mute_applies_to_non_admins_only() {
        let fx = Fixture::new();
        let admin = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(admin, "Ward", &[member]).unwrap();

        let until = fx.clock.now() + Duration::minutes(15);
        let chat = fx.directory.set_mute(&chat.id, admin, Some(until)).unwrap();

        let now = fx.clock.now();
        let err = fx.db.read(|tx| authorize_send(tx, &chat, &member, now)).unwrap_err();
        assert_eq!(err, ChatError::forbidden("muted"));
        assert!(fx.db.read(|tx| authorize_send(tx, &chat, &admin, now)).is_ok());

        fx.clock.advance(Duration::minutes(16));
        let later = fx.clock.now();
        assert!(fx.db.read(|tx| authorize_send(tx, &chat, &member, later)).is_ok());
    }

    #[test]
    fn test_mute_must_end_in_future() {
        let fx = Fixture::new();
        let admin = UserId::new();
        let chat = fx.directory.create_group_chat(admin, "Ward", &[UserId::new()]).unwrap();

        let past = fx.clock.now() - Duration::minutes(1);
        let err = fx.directory.set_mute(&chat.id, admin, Some(past)).unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        let err = fx.directory.set_rate_limit(&chat.id, admin, Some(0)).unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }

    #[test]
    fn test_moderation_is_audited_for_managers_only() {
        let fx = Fixture::new();
        let admin = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(admin, "Ward", &[member]).unwrap();

        let until = fx.clock.now() + Duration::minutes(5);
        fx.directory.set_mute(&chat.id, admin, Some(until)).unwrap();
        fx.directory.set_mute(&chat.id, admin, None).unwrap();
        fx.directory.set_rate_limit(&chat.id, admin, Some(3)).unwrap();

        let kinds: Vec<AuditKind> = fx
            .directory
            .audit_log(&chat.id, &admin)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![AuditKind::MuteSet, AuditKind::MuteCleared, AuditKind::RateLimitSet]
        );

        let err = fx.directory.audit_log(&chat.id, &member).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn test_list_chats_includes_removed_and_flags() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();
        fx.directory.remove_participant(&chat.id, creator, member).unwrap();

        let listed = fx.directory.list_chats(&member).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].can_manage);

        let mine = fx.directory.list_chats(&creator).unwrap();
        assert!(mine[0].can_manage);
        assert_eq!(mine[0].unread_count, 0);
    }

    #[test]
    fn test_mark_read_requires_access() {
        let fx = Fixture::new();
        let a = UserId::new();
        let (chat, _) = fx.directory.get_or_create_direct_chat(a, Some(UserId::new())).unwrap();

        let at = fx.directory.mark_read(&chat.id, a).unwrap();
        assert_eq!(at, fx.clock.now());

        let err = fx.directory.mark_read(&chat.id, UserId::new()).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }
}
