//! Shared fixture for the service and router tests.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::mpsc;

use huddle_shared::auth::issue_identity_token;
use huddle_shared::clock::{Clock, ManualClock};
use huddle_shared::crypto::{generate_symmetric_key, ChatKeyGateway};
use huddle_shared::protocol::{ClientCommand, ServerEvent};
use huddle_shared::types::{ChatId, UserId};
use huddle_store::{Chat, Database};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::directory::ChatDirectory;
use crate::dispatcher::Dispatcher;
use crate::hub::{ConnectionGuard, PresenceHub};
use crate::messaging::MessageService;

pub(crate) struct Fixture {
    pub db: Arc<Database>,
    pub clock: Arc<ManualClock>,
    pub directory: Arc<ChatDirectory>,
    pub messages: Arc<MessageService>,
    pub hub: Arc<PresenceHub>,
    pub dispatcher: Arc<Dispatcher>,
    pub state: AppState,
    signing_key: SigningKey,
}

impl Fixture {
    pub fn new() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let config = ServerConfig {
            auth_server_pubkey: signing_key.verifying_key().to_bytes(),
            connection_buffer: 64,
            ..ServerConfig::default()
        };

        let db = Arc::new(Database::open_in_memory().expect("in-memory database"));
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let gateway = Arc::new(ChatKeyGateway::new(generate_symmetric_key()));
        let state = AppState::new(config, db.clone(), clock.clone(), gateway);

        Self {
            directory: state.directory.clone(),
            messages: state.messages.clone(),
            hub: state.dispatcher.hub().clone(),
            dispatcher: state.dispatcher.clone(),
            db,
            clock,
            state,
            signing_key,
        }
    }

    /// A fresh direct chat between two new users.
    pub fn direct_chat(&self) -> (Chat, UserId, UserId) {
        let a = UserId::new();
        let b = UserId::new();
        let (chat, _) = self
            .directory
            .get_or_create_direct_chat(a, Some(b))
            .expect("direct chat");
        (chat, a, b)
    }

    /// Connect `user` and subscribe the connection to `chat`.
    pub fn join(&self, user: UserId, chat: &ChatId) -> (ConnectionGuard, mpsc::Receiver<ServerEvent>) {
        let (conn, rx) = self.dispatcher.connect(user).expect("connect");
        self.dispatcher
            .handle(&conn, ClientCommand::Join { chat_id: *chat })
            .expect("join");
        (conn, rx)
    }

    pub fn token_for(&self, user: UserId) -> String {
        issue_identity_token(user, self.clock.now() + Duration::hours(1), &self.signing_key)
            .encode()
            .expect("encode token")
    }
}

/// Everything queued for a connection so far.
pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
