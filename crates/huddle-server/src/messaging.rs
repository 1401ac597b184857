//! Message Store Adapter service: message lifecycle on top of the store.
//!
//! Reads go through [`MessageService::render`], the one place that decides
//! what a given viewer sees of a message.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use huddle_shared::clock::Clock;
use huddle_shared::constants::{MAX_ATTACHMENTS, MAX_EMOJI_BYTES, MAX_MESSAGE_CHARS};
use huddle_shared::crypto::{DecryptionContext, EncryptionContext, EncryptionGateway};
use huddle_shared::protocol::{DeletionInfo, MessageView, ReactionGroup};
use huddle_shared::types::{AttachmentId, AttachmentRef, ChatId, ChatKind, MessageId, UserId};
use huddle_shared::{ChatError, ChatResult};
use huddle_store::{AuditKind, Chat, Database, LastMessage, Message, NewMessage, StoreError, Tx};

use crate::directory::{authorize_read, authorize_send, load_chat, record_audit};

/// Body of a send, from HTTP or the realtime channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub attachment_ids: Vec<AttachmentId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHistory {
    pub messages: Vec<MessageView>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deletion {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub deleted_by: UserId,
    pub deleted_at: DateTime<Utc>,
    /// `false` when the message was already deleted for everyone.
    #[serde(skip)]
    pub changed: bool,
}

fn load_message(tx: &Tx<'_>, id: &MessageId) -> ChatResult<Message> {
    match tx.get_message(id) {
        Ok(message) => Ok(message),
        Err(StoreError::NotFound) => Err(ChatError::not_found("Message not found")),
        Err(e) => Err(e.into()),
    }
}

fn validate_emoji(raw: &str) -> ChatResult<String> {
    let emoji = raw.trim();
    if emoji.is_empty() {
        return Err(ChatError::invalid("Emoji is required"));
    }
    if emoji.len() > MAX_EMOJI_BYTES {
        return Err(ChatError::invalid("Emoji is too long"));
    }
    Ok(emoji.to_string())
}

fn authorize_pin(chat: &Chat, user: &UserId) -> ChatResult<()> {
    let allowed = match chat.kind {
        ChatKind::Direct => chat.is_participant(user),
        ChatKind::Group => chat.is_manager(user),
    };
    if allowed {
        Ok(())
    } else {
        Err(ChatError::forbidden(
            "Only direct chat participants or group admins can pin messages",
        ))
    }
}

pub struct MessageService {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn EncryptionGateway>,
    delete_window: Duration,
}

impl MessageService {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn EncryptionGateway>,
        delete_window: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            gateway,
            delete_window,
        }
    }

    /// Send a message. Returns the sender's own view of it.
    pub fn send(&self, chat_id: &ChatId, sender: UserId, input: &SendMessage) -> ChatResult<MessageView> {
        let text = input.text.trim();
        if text.is_empty() && input.attachment_ids.is_empty() {
            return Err(ChatError::invalid("Message text or an attachment is required"));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::invalid(format!(
                "Message text must be at most {MAX_MESSAGE_CHARS} characters"
            )));
        }
        if input.attachment_ids.len() > MAX_ATTACHMENTS {
            return Err(ChatError::invalid(format!(
                "At most {MAX_ATTACHMENTS} attachments per message"
            )));
        }

        let now = self.clock.now();
        let (message, plaintext) = self.db.write(|tx| {
            let mut chat = load_chat(tx, chat_id)?;
            authorize_send(tx, &chat, &sender, now)?;

            let encrypted = if text.is_empty() {
                None
            } else {
                let ctx = EncryptionContext {
                    chat_id: *chat_id,
                    sender_id: sender,
                };
                Some(self.gateway.encrypt(text, &ctx)?)
            };

            let mut mentions: Vec<UserId> = Vec::new();
            for id in &input.mentions {
                if chat.is_participant(id) && !mentions.contains(id) {
                    mentions.push(*id);
                }
            }

            let new = NewMessage {
                id: MessageId::new(),
                chat_id: *chat_id,
                sender_id: sender,
                sealed: encrypted.as_ref().map(|e| e.sealed.clone()),
                created_at: now,
                mentions,
                attachments: input
                    .attachment_ids
                    .iter()
                    .map(|id| AttachmentRef { id: *id })
                    .collect(),
            };
            let message = tx.insert_message(&new)?;

            chat.last_message = Some(LastMessage {
                message_id: message.id,
                text: message.sealed.clone(),
                sender,
                created_at: now,
            });
            chat.updated_at = now;
            chat.advance_read_state(sender, now);
            tx.save_chat(&chat)?;

            Ok::<_, ChatError>((message, encrypted.map(|e| e.plaintext_for_sender)))
        })?;

        info!(chat = %chat_id, sender = %sender, message = %message.id, "Message sent");
        Ok(build_view(&message, plaintext, Vec::new(), false))
    }

    /// History of a chat for one viewer, oldest first, with their read marker.
    pub fn get_messages_for_chat(&self, chat_id: &ChatId, viewer: UserId) -> ChatResult<MessageHistory> {
        self.db.read(|tx| {
            let chat = load_chat(tx, chat_id)?;
            authorize_read(&chat, &viewer)?;

            let mut reactions = tx.reaction_groups_for_chat(chat_id)?;
            let messages = tx
                .list_messages_visible_to(chat_id, &viewer)?
                .iter()
                .map(|m| {
                    let pinned = chat.pinned_message_ids.contains(&m.id);
                    let groups = reactions.remove(&m.id).unwrap_or_default();
                    self.render(m, &viewer, groups, pinned)
                })
                .collect();

            Ok(MessageHistory {
                messages,
                last_read_at: chat.last_read_at(&viewer),
            })
        })
    }

    /// What `viewer` sees of `message`. A tombstone never carries text.
    pub fn render(
        &self,
        message: &Message,
        viewer: &UserId,
        reactions: Vec<ReactionGroup>,
        pinned: bool,
    ) -> MessageView {
        let text = match (&message.sealed, message.deleted_for_all) {
            (Some(sealed), false) => {
                let ctx = DecryptionContext {
                    chat_id: message.chat_id,
                    viewer_id: *viewer,
                };
                match self.gateway.decrypt(sealed, &ctx) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(message = %message.id, viewer = %viewer, error = %e, "Cannot open message for viewer");
                        None
                    }
                }
            }
            _ => None,
        };
        build_view(message, text, reactions, pinned)
    }

    /// Add the reaction if absent, remove it if present.
    pub fn toggle_reaction(&self, message_id: &MessageId, user: UserId, emoji: &str) -> ChatResult<ReactionUpdate> {
        let emoji = validate_emoji(emoji)?;
        let now = self.clock.now();
        self.db.write(|tx| {
            let message = load_message(tx, message_id)?;
            let chat = load_chat(tx, &message.chat_id)?;
            authorize_read(&chat, &user)?;
            if message.deleted_for_all {
                return Err(ChatError::invalid("Cannot react to a deleted message"));
            }

            let added = tx.toggle_reaction(message_id, &user, &emoji, &now)?;
            debug!(message = %message_id, user = %user, emoji = %emoji, added, "Reaction toggled");

            Ok(ReactionUpdate {
                chat_id: message.chat_id,
                message_id: *message_id,
                reactions: tx.reaction_groups(message_id)?,
            })
        })
    }

    /// Hide a message from the caller only. Idempotent.
    pub fn delete_for_me(&self, message_id: &MessageId, user: UserId) -> ChatResult<ChatId> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let message = load_message(tx, message_id)?;
            let chat = load_chat(tx, &message.chat_id)?;
            authorize_read(&chat, &user)?;

            tx.hide_message_for(message_id, &user, &now)?;
            Ok(message.chat_id)
        })
    }

    /// Tombstone a message for everyone. Only its sender may, and only within
    /// the configured window. Repeating it is a no-op.
    pub fn delete_for_all(&self, message_id: &MessageId, user: UserId) -> ChatResult<Deletion> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let message = load_message(tx, message_id)?;
            let mut chat = load_chat(tx, &message.chat_id)?;
            authorize_read(&chat, &user)?;
            if message.sender_id != user {
                return Err(ChatError::forbidden(
                    "Only the sender can delete a message for everyone",
                ));
            }

            if message.deleted_for_all {
                return Ok(Deletion {
                    chat_id: message.chat_id,
                    message_id: *message_id,
                    deleted_by: message.deleted_by.unwrap_or(user),
                    deleted_at: message.deleted_at.unwrap_or(now),
                    changed: false,
                });
            }

            if now - message.created_at > self.delete_window {
                return Err(ChatError::Expired(
                    "Messages can only be deleted for everyone shortly after sending".into(),
                ));
            }

            tx.mark_deleted_for_all(message_id, &user, &now)?;
            if let Some(last) = chat
                .last_message
                .as_mut()
                .filter(|last| last.message_id == *message_id)
            {
                last.text = None;
                tx.save_chat(&chat)?;
            }
            record_audit(
                tx,
                &chat,
                &user,
                AuditKind::MessageDeletedForAll,
                json!({ "messageId": message_id }),
                now,
            )?;

            info!(chat = %chat.id, message = %message_id, "Message deleted for everyone");
            Ok(Deletion {
                chat_id: chat.id,
                message_id: *message_id,
                deleted_by: user,
                deleted_at: now,
                changed: true,
            })
        })
    }

    /// Pin a message; the newest pin goes last. Pinning twice is a no-op.
    pub fn pin(&self, message_id: &MessageId, user: UserId) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let message = load_message(tx, message_id)?;
            let mut chat = load_chat(tx, &message.chat_id)?;
            authorize_pin(&chat, &user)?;
            if message.deleted_for_all {
                return Err(ChatError::invalid("Cannot pin a deleted message"));
            }
            if chat.pinned_message_ids.contains(message_id) {
                return Ok(chat);
            }

            chat.pinned_message_ids.push(*message_id);
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &user, AuditKind::PinAdded, json!({ "messageId": message_id }), now)?;
            Ok(chat)
        })
    }

    pub fn unpin(&self, message_id: &MessageId, user: UserId) -> ChatResult<Chat> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let message = load_message(tx, message_id)?;
            let mut chat = load_chat(tx, &message.chat_id)?;
            authorize_pin(&chat, &user)?;
            if !chat.pinned_message_ids.contains(message_id) {
                return Ok(chat);
            }

            chat.pinned_message_ids.retain(|id| id != message_id);
            chat.updated_at = now;
            tx.save_chat(&chat)?;
            record_audit(tx, &chat, &user, AuditKind::PinRemoved, json!({ "messageId": message_id }), now)?;
            Ok(chat)
        })
    }
}

fn build_view(
    message: &Message,
    text: Option<String>,
    reactions: Vec<ReactionGroup>,
    pinned: bool,
) -> MessageView {
    if message.deleted_for_all {
        return MessageView {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            text: None,
            created_at: message.created_at,
            mentions: Vec::new(),
            reactions: Vec::new(),
            attachments: Vec::new(),
            deleted_for_all: true,
            deletion: message.deleted_by.zip(message.deleted_at).map(|(by, at)| DeletionInfo {
                deleted_by: by,
                deleted_at: at,
            }),
            pinned,
        };
    }

    MessageView {
        id: message.id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        text,
        created_at: message.created_at,
        mentions: message.mentions.clone(),
        reactions,
        attachments: message.attachments.clone(),
        deleted_for_all: false,
        deletion: None,
        pinned,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::test_support::Fixture;

    fn text(body: &str) -> SendMessage {
        SendMessage {
            text: body.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_send_requires_text_or_attachment() {
        let fx = Fixture::new();
        let (chat, a, _) = fx.direct_chat();

        let err = fx.messages.send(&chat.id, a, &text("   ")).unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));

        let attachment_only = SendMessage {
            attachment_ids: vec![AttachmentId::new()],
            ..Default::default()
        };
        let view = fx.messages.send(&chat.id, a, &attachment_only).unwrap();
        assert_eq!(view.text, None);
        assert_eq!(view.attachments.len(), 1);
    }

    #[test]
    fn test_send_trims_and_never_stores_plaintext() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();

        let view = fx.messages.send(&chat.id, a, &text("  vitals are stable  ")).unwrap();
        assert_eq!(view.text.as_deref(), Some("vitals are stable"));

        let stored = fx.db.read(|tx| tx.get_message(&view.id)).unwrap();
        let sealed = stored.sealed.expect("text is sealed");
        assert!(!sealed
            .ciphertext
            .windows(b"vitals".len())
            .any(|w| w == b"vitals"));

        let history = fx.messages.get_messages_for_chat(&chat.id, b).unwrap();
        assert_eq!(history.messages[0].text.as_deref(), Some("vitals are stable"));
    }

    #[test]
    fn test_send_updates_last_message_and_sender_read_state() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();

        fx.messages.send(&chat.id, a, &text("first")).unwrap();
        fx.clock.advance(Duration::seconds(5));
        let second = fx.messages.send(&chat.id, a, &text("second")).unwrap();

        let stored = fx.directory.load(&chat.id).unwrap();
        assert_eq!(stored.last_read_at(&a), Some(second.created_at));
        assert_eq!(stored.updated_at, second.created_at);

        let views = fx.directory.list_chats(&b).unwrap();
        let last = views[0].last_message.as_ref().unwrap();
        assert_eq!(last.text.as_deref(), Some("second"));
        assert_eq!(views[0].unread_count, 2);

        fx.directory.mark_read(&chat.id, b).unwrap();
        assert_eq!(fx.directory.list_chats(&b).unwrap()[0].unread_count, 0);
    }

    #[test]
    fn test_mentions_limited_to_participants() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let outsider = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();

        let input = SendMessage {
            text: "@all".into(),
            mentions: vec![member, outsider, member],
            ..Default::default()
        };
        let view = fx.messages.send(&chat.id, creator, &input).unwrap();
        assert_eq!(view.mentions, vec![member]);
    }

    #[test]
    fn test_removed_member_keeps_history_unaltered() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(creator, "Ward", &[member]).unwrap();

        let sent = fx.messages.send(&chat.id, member, &text("handover at 7")).unwrap();
        fx.directory.remove_participant(&chat.id, creator, member).unwrap();

        let history = fx.messages.get_messages_for_chat(&chat.id, member).unwrap();
        assert_eq!(history.messages, vec![sent]);

        let err = fx.messages.send(&chat.id, member, &text("still here?")).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn test_outsider_cannot_read() {
        let fx = Fixture::new();
        let (chat, _, _) = fx.direct_chat();
        let err = fx.messages.get_messages_for_chat(&chat.id, UserId::new()).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn test_reaction_toggle_round_trip() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();
        let msg = fx.messages.send(&chat.id, a, &text("lunch?")).unwrap();

        let before = fx.messages.toggle_reaction(&msg.id, a, "👍").unwrap().reactions;
        let added = fx.messages.toggle_reaction(&msg.id, b, "🎉").unwrap().reactions;
        assert_eq!(added.len(), 2);
        let after = fx.messages.toggle_reaction(&msg.id, b, "🎉").unwrap().reactions;
        assert_eq!(after, before);

        let history = fx.messages.get_messages_for_chat(&chat.id, b).unwrap();
        assert_eq!(history.messages[0].reactions, before);
    }

    #[test]
    fn test_reaction_rejects_bad_emoji() {
        let fx = Fixture::new();
        let (chat, a, _) = fx.direct_chat();
        let msg = fx.messages.send(&chat.id, a, &text("ok")).unwrap();

        let err = fx.messages.toggle_reaction(&msg.id, a, " ").unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        let err = fx.messages.toggle_reaction(&msg.id, a, &"x".repeat(64)).unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        let err = fx.messages.toggle_reaction(&MessageId::new(), a, "👍").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_cannot_react_to_deleted_message() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();
        let msg = fx.messages.send(&chat.id, a, &text("sent to wrong chat")).unwrap();
        fx.messages.delete_for_all(&msg.id, a).unwrap();

        let err = fx.messages.toggle_reaction(&msg.id, b, "👍").unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        assert!(fx.db.read(|tx| tx.reaction_groups(&msg.id)).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_reactions_keep_every_user() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let members: Vec<UserId> = (0..12).map(|_| UserId::new()).collect();
        let chat = fx.directory.create_group_chat(creator, "Ward", &members).unwrap();
        let message_id = fx.messages.send(&chat.id, creator, &text("drill at noon")).unwrap().id;

        let handles: Vec<_> = members
            .iter()
            .copied()
            .map(|user| {
                let messages = fx.messages.clone();
                thread::spawn(move || messages.toggle_reaction(&message_id, user, "✅"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let history = fx.messages.get_messages_for_chat(&chat.id, creator).unwrap();
        let groups = &history.messages[0].reactions;
        assert_eq!(groups.len(), 1);
        let reacted: HashSet<UserId> = groups[0].user_ids.iter().copied().collect();
        assert_eq!(reacted, members.iter().copied().collect());
    }

    #[test]
    fn test_concurrent_sends_are_atomic_and_ordered() {
        let fx = Fixture::new();
        let creator = UserId::new();
        let members: Vec<UserId> = (0..8).map(|_| UserId::new()).collect();
        let chat = fx.directory.create_group_chat(creator, "Ward", &members).unwrap();

        let handles: Vec<_> = members
            .iter()
            .copied()
            .enumerate()
            .map(|(i, sender)| {
                let messages = fx.messages.clone();
                let chat_id = chat.id;
                thread::spawn(move || messages.send(&chat_id, sender, &text(&format!("bed {i} clear"))))
            })
            .collect();
        let sent: HashSet<MessageId> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap().id)
            .collect();
        assert_eq!(sent.len(), members.len());

        let stored = fx.db.read(|tx| tx.list_messages_visible_to(&chat.id, &creator)).unwrap();
        assert_eq!(stored.len(), members.len());
        assert!(stored.iter().all(|m| m.created_at == fx.clock.now()));
        assert!(stored.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        assert_eq!(stored.iter().map(|m| m.id).collect::<HashSet<_>>(), sent);

        let last = fx.directory.load(&chat.id).unwrap().last_message.unwrap();
        assert_eq!(Some(last.message_id), stored.last().map(|m| m.id));
    }

    #[test]
    fn test_delete_for_me_hides_only_for_caller() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();
        let msg = fx.messages.send(&chat.id, a, &text("typo")).unwrap();

        assert_eq!(fx.messages.delete_for_me(&msg.id, b).unwrap(), chat.id);
        fx.messages.delete_for_me(&msg.id, b).unwrap();

        assert!(fx.messages.get_messages_for_chat(&chat.id, b).unwrap().messages.is_empty());
        assert_eq!(fx.messages.get_messages_for_chat(&chat.id, a).unwrap().messages.len(), 1);

        let preview = &fx.directory.list_chats(&b).unwrap()[0];
        assert_eq!(preview.last_message.as_ref().unwrap().text, None);
        assert_eq!(preview.unread_count, 0);
    }

    #[test]
    fn test_delete_for_all_within_window_leaves_tombstone() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();
        let msg = fx.messages.send(&chat.id, a, &text("wrong patient")).unwrap();
        fx.messages.toggle_reaction(&msg.id, b, "😮").unwrap();

        fx.clock.advance(Duration::minutes(9));
        let deletion = fx.messages.delete_for_all(&msg.id, a).unwrap();
        assert!(deletion.changed);
        assert_eq!(deletion.deleted_by, a);

        for viewer in [a, b] {
            let history = fx.messages.get_messages_for_chat(&chat.id, viewer).unwrap();
            let view = &history.messages[0];
            assert!(view.deleted_for_all);
            assert_eq!(view.text, None);
            assert!(view.reactions.is_empty());
            assert_eq!(view.deletion.as_ref().map(|d| d.deleted_by), Some(a));
        }

        let preview = &fx.directory.list_chats(&b).unwrap()[0];
        assert_eq!(preview.last_message.as_ref().unwrap().text, None);

        let again = fx.messages.delete_for_all(&msg.id, a).unwrap();
        assert!(!again.changed);
        let audit = fx.directory.audit_log(&chat.id, &a).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, AuditKind::MessageDeletedForAll);
    }

    #[test]
    fn test_delete_for_all_after_window_is_expired() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();
        let msg = fx.messages.send(&chat.id, a, &text("too late")).unwrap();

        let err = fx.messages.delete_for_all(&msg.id, b).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        fx.clock.advance(Duration::minutes(10) + Duration::seconds(1));
        let err = fx.messages.delete_for_all(&msg.id, a).unwrap_err();
        assert!(matches!(err, ChatError::Expired(_)));

        let history = fx.messages.get_messages_for_chat(&chat.id, b).unwrap();
        assert!(!history.messages[0].deleted_for_all);
        assert_eq!(history.messages[0].text.as_deref(), Some("too late"));
    }

    #[test]
    fn test_rate_limit_allows_three_of_five() {
        let fx = Fixture::new();
        let admin = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(admin, "Ward", &[member]).unwrap();
        fx.directory.set_rate_limit(&chat.id, admin, Some(3)).unwrap();

        let results: Vec<ChatResult<MessageView>> = (0..5)
            .map(|i| {
                fx.clock.advance(Duration::seconds(5));
                fx.messages.send(&chat.id, member, &text(&format!("update {i}")))
            })
            .collect();

        assert!(results[..3].iter().all(|r| r.is_ok()));
        for result in &results[3..] {
            assert_eq!(result.as_ref().unwrap_err(), &ChatError::RateLimited { limit: 3 });
        }

        fx.clock.advance(Duration::seconds(60));
        assert!(fx.messages.send(&chat.id, member, &text("later")).is_ok());
    }

    #[test]
    fn test_mute_blocks_members_not_admins() {
        let fx = Fixture::new();
        let admin = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(admin, "Ward", &[member]).unwrap();

        let until = fx.clock.now() + Duration::minutes(15);
        fx.directory.set_mute(&chat.id, admin, Some(until)).unwrap();

        let err = fx.messages.send(&chat.id, member, &text("hello?")).unwrap_err();
        assert_eq!(err, ChatError::forbidden("muted"));
        assert!(fx.messages.send(&chat.id, admin, &text("quiet please")).is_ok());
    }

    #[test]
    fn test_pins_append_last_and_ignore_duplicates() {
        let fx = Fixture::new();
        let admin = UserId::new();
        let member = UserId::new();
        let chat = fx.directory.create_group_chat(admin, "Ward", &[member]).unwrap();
        let first = fx.messages.send(&chat.id, member, &text("one")).unwrap();
        let second = fx.messages.send(&chat.id, member, &text("two")).unwrap();

        let err = fx.messages.pin(&first.id, member).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        fx.messages.pin(&first.id, admin).unwrap();
        fx.messages.pin(&second.id, admin).unwrap();
        let chat_after = fx.messages.pin(&first.id, admin).unwrap();
        assert_eq!(chat_after.pinned_message_ids, vec![first.id, second.id]);

        let history = fx.messages.get_messages_for_chat(&chat.id, member).unwrap();
        assert!(history.messages.iter().all(|m| m.pinned));

        let chat_after = fx.messages.unpin(&first.id, admin).unwrap();
        assert_eq!(chat_after.pinned_message_ids, vec![second.id]);

        let kinds: Vec<AuditKind> = fx
            .directory
            .audit_log(&chat.id, &admin)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![AuditKind::PinAdded, AuditKind::PinAdded, AuditKind::PinRemoved]);
    }

    #[test]
    fn test_history_orders_by_creation() {
        let fx = Fixture::new();
        let (chat, a, b) = fx.direct_chat();
        let m1 = fx.messages.send(&chat.id, a, &text("1")).unwrap();
        let m2 = fx.messages.send(&chat.id, b, &text("2")).unwrap();
        fx.clock.advance(Duration::milliseconds(1));
        let m3 = fx.messages.send(&chat.id, a, &text("3")).unwrap();

        let ids: Vec<MessageId> = fx
            .messages
            .get_messages_for_chat(&chat.id, a)
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![m1.id, m2.id, m3.id]);
    }
}
