//! Realtime Dispatcher.
//!
//! Routes inbound realtime commands to the directory and message service and
//! fans the results out through the hub. HTTP handlers with a realtime
//! counterpart go through the same methods, so both paths broadcast the same
//! events.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use huddle_shared::protocol::{ClientCommand, MessageView, ServerEvent};
use huddle_shared::types::{ChatId, MessageId, UserId};
use huddle_shared::{ChatError, ChatResult};
use huddle_store::Chat;

use crate::directory::ChatDirectory;
use crate::hub::{ConnectionGuard, PresenceHub};
use crate::messaging::{Deletion, MessageService, ReactionUpdate, SendMessage};

pub struct Dispatcher {
    directory: Arc<ChatDirectory>,
    messages: Arc<MessageService>,
    hub: Arc<PresenceHub>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<ChatDirectory>,
        messages: Arc<MessageService>,
        hub: Arc<PresenceHub>,
    ) -> Self {
        Self {
            directory,
            messages,
            hub,
        }
    }

    #[cfg(test)]
    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }

    /// Open a live connection for an authenticated user.
    pub fn connect(&self, user: UserId) -> ChatResult<(ConnectionGuard, mpsc::Receiver<ServerEvent>)> {
        let chats = self.directory.participating_chat_ids(&user)?;
        Ok(self.hub.connect(user, chats))
    }

    /// Handle one inbound text frame. A failure is logged and reported to
    /// the originating connection only, as `command:rejected`.
    pub fn handle_frame(&self, conn: &ConnectionGuard, frame: &str) {
        let command = match serde_json::from_str::<ClientCommand>(frame) {
            Ok(command) => command,
            Err(e) => {
                let name = event_name(frame);
                warn!(conn = %conn.id(), user = %conn.user(), command = %name, error = %e, "Malformed realtime command");
                self.hub.send_to(
                    conn.id(),
                    ServerEvent::CommandRejected {
                        command: name,
                        error: "Malformed command".into(),
                    },
                );
                return;
            }
        };

        let name = command.name();
        if let Err(e) = self.handle(conn, command) {
            warn!(conn = %conn.id(), user = %conn.user(), command = name, error = %e, "Realtime command failed");
            self.hub.send_to(
                conn.id(),
                ServerEvent::CommandRejected {
                    command: name.to_string(),
                    error: e.public_message(),
                },
            );
        }
    }

    /// Every command re-checks membership against the current chat state.
    pub fn handle(&self, conn: &ConnectionGuard, command: ClientCommand) -> ChatResult<()> {
        let user = conn.user();
        match command {
            ClientCommand::Join { chat_id } => {
                let chat = self.current_member_chat(&chat_id, &user)?;
                self.hub.join(conn.id(), chat_id, &chat.participants);
            }
            ClientCommand::Send {
                chat_id,
                text,
                mentions,
                attachment_ids,
            } => {
                let input = SendMessage {
                    text,
                    mentions,
                    attachment_ids,
                };
                self.send_message(&chat_id, user, &input)?;
            }
            ClientCommand::TypingStart { chat_id } => {
                self.current_member_chat(&chat_id, &user)?;
                self.hub.broadcast(&chat_id, ServerEvent::TypingStarted { chat_id, user_id: user });
            }
            ClientCommand::TypingStop { chat_id } => {
                self.current_member_chat(&chat_id, &user)?;
                self.hub.broadcast(&chat_id, ServerEvent::TypingStopped { chat_id, user_id: user });
            }
            ClientCommand::ToggleReaction { message_id, emoji } => {
                self.toggle_reaction(&message_id, user, &emoji)?;
            }
            ClientCommand::DeleteForAll { message_id } => {
                self.delete_for_all(&message_id, user)?;
            }
        }
        Ok(())
    }

    fn current_member_chat(&self, chat_id: &ChatId, user: &UserId) -> ChatResult<Chat> {
        let chat = self.directory.load(chat_id)?;
        if !chat.is_participant(user) {
            return Err(ChatError::forbidden("Not a participant of this chat"));
        }
        Ok(chat)
    }

    pub fn send_message(&self, chat_id: &ChatId, sender: UserId, input: &SendMessage) -> ChatResult<MessageView> {
        let view = self.messages.send(chat_id, sender, input)?;
        self.hub.broadcast(
            chat_id,
            ServerEvent::MessageNew {
                message: view.clone(),
            },
        );
        Ok(view)
    }

    pub fn toggle_reaction(&self, message_id: &MessageId, user: UserId, emoji: &str) -> ChatResult<ReactionUpdate> {
        let update = self.messages.toggle_reaction(message_id, user, emoji)?;
        self.hub.broadcast(
            &update.chat_id,
            ServerEvent::ReactionsUpdated {
                chat_id: update.chat_id,
                message_id: update.message_id,
                reactions: update.reactions.clone(),
            },
        );
        Ok(update)
    }

    pub fn delete_for_all(&self, message_id: &MessageId, user: UserId) -> ChatResult<Deletion> {
        let deletion = self.messages.delete_for_all(message_id, user)?;
        if deletion.changed {
            self.hub.broadcast(
                &deletion.chat_id,
                ServerEvent::MessageDeleted {
                    chat_id: deletion.chat_id,
                    message_id: deletion.message_id,
                    deleted_by: deletion.deleted_by,
                    deleted_at: deletion.deleted_at,
                },
            );
        }
        Ok(deletion)
    }

    /// Membership, moderation or pins changed.
    pub fn chat_updated(&self, chat: &Chat) {
        debug!(chat = %chat.id, "Announcing chat update");
        self.hub.broadcast(&chat.id, ServerEvent::ChatUpdated { chat_id: chat.id });
    }

    /// `user` became a participant: announce their presence there and tell
    /// their open connections about the chat.
    pub fn participant_added(&self, chat: &Chat, user: &UserId) {
        self.hub.track_membership(chat.id, user);
        self.chat_updated(chat);
        self.hub
            .send_to_user_outside(&chat.id, user, ServerEvent::ChatUpdated { chat_id: chat.id });
    }

    /// `user` is no longer a participant: stop live delivery to them.
    pub fn participant_removed(&self, chat: &Chat, user: &UserId) {
        self.hub.evict(&chat.id, user);
        self.chat_updated(chat);
        self.hub
            .send_to_user_outside(&chat.id, user, ServerEvent::ChatUpdated { chat_id: chat.id });
    }
}

/// Best-effort event name of a frame that failed to parse as a command.
fn event_name(frame: &str) -> String {
    serde_json::from_str::<serde_json::Value>(frame)
        .ok()
        .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
