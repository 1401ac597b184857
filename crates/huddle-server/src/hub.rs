//! Presence & Typing Hub.
//!
//! Owns every piece of ephemeral realtime state in the process: how many live
//! connections each user has, which chats a connected user belongs to, and
//! which connections are subscribed to each chat channel. Nothing else
//! touches these maps; callers go through `connect`, `join`, `broadcast` and
//! the disconnect performed by [`ConnectionGuard`].
//!
//! All operations are synchronous and never await, so disconnect can run from
//! `Drop` on every exit path of a connection task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};

use huddle_shared::protocol::ServerEvent;
use huddle_shared::types::{ChatId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Presence {
    count: usize,
    /// Chats whose channels hear about this user's presence changes.
    chats: HashSet<ChatId>,
}

struct LiveConnection {
    user: UserId,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct HubState {
    presence: HashMap<UserId, Presence>,
    channels: HashMap<ChatId, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, LiveConnection>,
}

impl HubState {
    fn deliver(&self, conn: ConnectionId, event: &ServerEvent) {
        let Some(live) = self.connections.get(&conn) else {
            return;
        };
        if live.tx.try_send(event.clone()).is_err() {
            debug!(conn = %conn, user = %live.user, "Dropping event for slow connection");
        }
    }

    fn broadcast(&self, chat: &ChatId, event: &ServerEvent) {
        if let Some(subscribers) = self.channels.get(chat) {
            for conn in subscribers {
                self.deliver(*conn, event);
            }
        }
    }

    fn unsubscribe(&mut self, chat: &ChatId, conn: &ConnectionId) {
        if let Some(subscribers) = self.channels.get_mut(chat) {
            subscribers.remove(conn);
            if subscribers.is_empty() {
                self.channels.remove(chat);
            }
        }
    }
}

pub struct PresenceHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    buffer: usize,
}

impl PresenceHub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a live connection for `user`, who participates in `chats`.
    ///
    /// The first connection of a user announces `presence:online` on every
    /// one of those chats. Dropping the returned guard disconnects.
    pub fn connect(
        self: &Arc<Self>,
        user: UserId,
        chats: impl IntoIterator<Item = ChatId>,
    ) -> (ConnectionGuard, mpsc::Receiver<ServerEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut state = self.lock();
        state.connections.insert(id, LiveConnection { user, tx });

        let presence = state.presence.entry(user).or_insert_with(|| Presence {
            count: 0,
            chats: HashSet::new(),
        });
        presence.chats.extend(chats);
        presence.count += 1;
        let first = presence.count == 1;
        let announce: Vec<ChatId> = if first {
            presence.chats.iter().copied().collect()
        } else {
            Vec::new()
        };

        let event = ServerEvent::PresenceOnline { user_id: user };
        for chat in &announce {
            state.broadcast(chat, &event);
        }
        drop(state);

        info!(conn = %id, user = %user, first, "Realtime connection opened");

        (
            ConnectionGuard {
                hub: Arc::clone(self),
                id,
                user,
            },
            rx,
        )
    }

    /// Unregister a connection. Unknown ids are ignored, so calling this
    /// twice cannot push the count below zero.
    pub fn disconnect(&self, id: ConnectionId) {
        let mut state = self.lock();
        let Some(live) = state.connections.remove(&id) else {
            return;
        };
        let user = live.user;

        let subscribed: Vec<ChatId> = state
            .channels
            .iter()
            .filter(|(_, subs)| subs.contains(&id))
            .map(|(chat, _)| *chat)
            .collect();
        for chat in &subscribed {
            state.unsubscribe(chat, &id);
        }

        let went_offline = match state.presence.get_mut(&user) {
            Some(presence) => {
                presence.count = presence.count.saturating_sub(1);
                presence.count == 0
            }
            None => false,
        };

        if went_offline {
            if let Some(presence) = state.presence.remove(&user) {
                let event = ServerEvent::PresenceOffline { user_id: user };
                for chat in &presence.chats {
                    state.broadcast(chat, &event);
                }
            }
        }
        drop(state);

        info!(conn = %id, user = %user, offline = went_offline, "Realtime connection closed");
    }

    /// Subscribe a connection to a chat channel, then replay to it a snapshot
    /// of which other `participants` are online right now.
    pub fn join(&self, id: ConnectionId, chat: ChatId, participants: &BTreeSet<UserId>) {
        let mut state = self.lock();
        let Some(user) = state.connections.get(&id).map(|c| c.user) else {
            return;
        };

        state.channels.entry(chat).or_default().insert(id);
        if let Some(presence) = state.presence.get_mut(&user) {
            presence.chats.insert(chat);
        }

        for other in participants.iter().filter(|p| **p != user) {
            let online = state.presence.get(other).is_some_and(|p| p.count > 0);
            if online {
                state.deliver(id, &ServerEvent::PresenceOnline { user_id: *other });
            }
        }

        debug!(conn = %id, chat = %chat, "Joined chat channel");
    }

    /// Fan an event out to every connection subscribed to `chat`.
    pub fn broadcast(&self, chat: &ChatId, event: ServerEvent) {
        self.lock().broadcast(chat, &event);
    }

    /// Deliver an event to one connection only.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        self.lock().deliver(id, &event);
    }

    /// Deliver an event to every connection of one user that is not already
    /// subscribed to `chat`, so nobody receives it twice alongside a
    /// broadcast.
    pub fn send_to_user_outside(&self, chat: &ChatId, user: &UserId, event: ServerEvent) {
        let state = self.lock();
        let subscribed = state.channels.get(chat);
        for (id, live) in &state.connections {
            if live.user == *user && !subscribed.is_some_and(|subs| subs.contains(id)) {
                state.deliver(*id, &event);
            }
        }
    }

    /// A user became a participant of `chat`: their presence changes are
    /// announced there from now on.
    pub fn track_membership(&self, chat: ChatId, user: &UserId) {
        if let Some(presence) = self.lock().presence.get_mut(user) {
            presence.chats.insert(chat);
        }
    }

    /// A user is no longer a participant of `chat`: drop their connections
    /// from its channel and stop announcing their presence there.
    pub fn evict(&self, chat: &ChatId, user: &UserId) {
        let mut state = self.lock();
        let conns: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, live)| live.user == *user)
            .map(|(id, _)| *id)
            .collect();
        for conn in &conns {
            state.unsubscribe(chat, conn);
        }
        if let Some(presence) = state.presence.get_mut(user) {
            presence.chats.remove(chat);
        }

        debug!(chat = %chat, user = %user, "Evicted from chat channel");
    }

    #[cfg(test)]
    pub fn connection_count(&self, user: &UserId) -> usize {
        self.lock().presence.get(user).map(|p| p.count).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.connection_count(user) > 0
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, id: ConnectionId, chat: &ChatId) -> bool {
        self.lock()
            .channels
            .get(chat)
            .is_some_and(|subs| subs.contains(&id))
    }
}

/// A live connection. Disconnects from the hub when dropped, however the
/// connection task ends.
pub struct ConnectionGuard {
    hub: Arc<PresenceHub>,
    id: ConnectionId,
    user: UserId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> UserId {
        self.user
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}
