use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shared::{
    domain::UserId,
    protocol::{
        ChatMessageDto, ChatSummary, Envelope, NewMessageData, UserSummary, ACTION_NEW_MESSAGE,
        SUBSYSTEM_CHAT,
    },
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::warn;

pub mod config;
pub mod directory;
pub mod error;
pub mod history;
pub mod rest;
pub mod router;
pub mod session;
pub mod socket;

pub use config::{load_settings, Settings};
pub use directory::{Conversation, Directory};
pub use error::GatewayError;
pub use history::{ChatMessage, History};
pub use router::StoreCommand;
pub use session::{AuthTokens, CredentialStore, MemoryCredentialStore, Session, SessionStore};
pub use socket::{ChatSocket, ConnectionState, EnvelopePattern};

use rest::ApiGateway;

/// Lifecycle of every paginated, backend-sourced list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListStatus {
    #[default]
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived {
        message: ChatMessage,
    },
    UnreadChanged {
        interlocutor_id: UserId,
        has_unread: bool,
    },
    DirectoryRefreshed,
    ConnectionStateChanged(ConnectionState),
    SessionExpired,
}

/// The client core: one socket session, one REST gateway, the conversation
/// directory and the open conversation's history, glued together by the
/// message router.
///
/// A client drives at most one socket session; after [`logout`](Self::logout)
/// create a new client for the next login.
pub struct ChatClient {
    settings: Settings,
    gateway: ApiGateway,
    socket: Arc<ChatSocket>,
    tokens: Arc<AuthTokens>,
    session: SessionStore,
    directory: Directory,
    history: History,
    events: broadcast::Sender<ClientEvent>,
    tasks_started: Mutex<bool>,
}

impl ChatClient {
    pub fn new(settings: Settings, credentials: Arc<dyn CredentialStore>) -> Arc<Self> {
        let tokens = Arc::new(AuthTokens::new(credentials));
        let gateway = ApiGateway::new(settings.api_base_url.clone(), Arc::clone(&tokens));
        let socket = ChatSocket::new(&settings, Arc::clone(&tokens));
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            settings,
            gateway,
            socket,
            tokens,
            session: SessionStore::new(),
            directory: Directory::new(),
            history: History::new(),
            events,
            tasks_started: Mutex::new(false),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.socket.state()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.session.current().await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<UserSummary> {
        Ok(self.gateway.register(username, password).await?)
    }

    /// Exchanges credentials, establishes the session and starts the socket
    /// plus the router tasks.
    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> Result<Session> {
        let pair = self.gateway.obtain_tokens(username, password).await?;
        self.tokens.replace(pair).await;

        let me = match self.gateway.fetch_me().await {
            Ok(me) => me,
            Err(err) => return Err(self.auth_checked(err).await),
        };

        self.directory.reset().await;
        self.history.reset().await;
        let session = self.session.establish(me.id, me.username).await;
        self.start_background_tasks().await;
        Ok(session)
    }

    /// Re-enters a previous session from persisted credentials, if any.
    pub async fn resume(self: &Arc<Self>) -> Result<Option<Session>> {
        self.tokens.hydrate().await?;
        if self.tokens.access().await.is_none() {
            return Ok(None);
        }

        match self.gateway.fetch_me().await {
            Ok(me) => {
                let session = self.session.establish(me.id, me.username).await;
                self.start_background_tasks().await;
                Ok(Some(session))
            }
            Err(err) if err.is_unauthenticated() => {
                self.force_logout().await;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn logout(&self) {
        self.shutdown_session(false).await;
    }

    /// Replaces the directory from the backend listing.
    pub async fn load_chats(&self) -> Result<()> {
        let snapshot = self.directory.begin_load().await;
        match self.gateway.list_chats().await {
            Ok(page) => {
                self.directory.complete_load(page, snapshot).await;
                let _ = self.events.send(ClientEvent::DirectoryRefreshed);
                Ok(())
            }
            Err(err) => {
                self.directory.fail_load().await;
                Err(self.auth_checked(err).await)
            }
        }
    }

    /// Follows the directory's `next` cursor; a no-op when it is exhausted.
    pub async fn load_more_chats(&self) -> Result<()> {
        let Some(next) = self.directory.next_cursor().await else {
            return Ok(());
        };
        let snapshot = self.directory.begin_load().await;
        match self.gateway.fetch_page::<ChatSummary>(&next).await {
            Ok(page) => {
                self.directory.complete_next_page(page, snapshot).await;
                let _ = self.events.send(ClientEvent::DirectoryRefreshed);
                Ok(())
            }
            Err(err) => {
                self.directory.fail_load().await;
                Err(self.auth_checked(err).await)
            }
        }
    }

    /// Opens a conversation: makes it the single open entry, loads the first
    /// history page, persists the read state and clears the unread flag.
    pub async fn open_conversation(&self, interlocutor: UserId) -> Result<()> {
        self.directory.set_open(interlocutor).await;
        self.history.begin_load(interlocutor).await;

        match self.gateway.list_messages(interlocutor).await {
            Ok(page) => self.history.complete_load(interlocutor, page).await,
            Err(err) => {
                self.history.fail_load(interlocutor).await;
                return Err(self.auth_checked(err).await);
            }
        }

        if let Err(err) = self.gateway.read_all_messages(interlocutor).await {
            if err.is_unauthenticated() {
                self.force_logout().await;
                return Err(err.into());
            }
            warn!(interlocutor = interlocutor.0, %err, "failed to persist read state");
        }
        self.directory.mark_read(interlocutor).await;
        let _ = self.events.send(ClientEvent::UnreadChanged {
            interlocutor_id: interlocutor,
            has_unread: false,
        });
        Ok(())
    }

    pub async fn close_conversation(&self) {
        self.directory.clear_open().await;
    }

    /// Appends the next (older) history page; a no-op when the cursor is
    /// exhausted.
    pub async fn load_older_messages(&self) -> Result<()> {
        let Some(interlocutor) = self.history.interlocutor().await else {
            return Ok(());
        };
        let Some(next) = self.history.next_cursor().await else {
            return Ok(());
        };
        match self.gateway.fetch_page::<ChatMessageDto>(&next).await {
            Ok(page) => {
                self.history.complete_next_page(interlocutor, page).await;
                Ok(())
            }
            Err(err) => {
                self.history.fail_load(interlocutor).await;
                Err(self.auth_checked(err).await)
            }
        }
    }

    /// Sends a chat message over the socket. No delivery acknowledgement is
    /// awaited; the server echoes the message back through `new_message`.
    pub async fn send_message(self: &Arc<Self>, interlocutor: UserId, text: &str) -> Result<()> {
        let Some(access) = self.tokens.access().await else {
            anyhow::bail!("not logged in");
        };
        self.socket
            .send(Envelope::chat_message(access, interlocutor, text));

        // First message to someone the directory has never seen: the backend
        // creates the conversation on receipt, so refresh shortly after.
        if !self.directory.contains(interlocutor).await {
            let client = Arc::clone(self);
            let delay = Duration::from_millis(self.settings.directory_refresh_delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = client.load_chats().await {
                    warn!(%err, "directory refresh after first message failed");
                }
            });
        }
        Ok(())
    }

    pub async fn fetch_interlocutor(&self, user_id: UserId) -> Result<UserSummary> {
        match self.gateway.fetch_user(user_id).await {
            Ok(user) => Ok(user),
            Err(err) => Err(self.auth_checked(err).await),
        }
    }

    async fn start_background_tasks(self: &Arc<Self>) {
        let mut started = self.tasks_started.lock().await;
        if *started {
            return;
        }
        *started = true;
        drop(started);

        tokio::spawn(Arc::clone(&self.socket).run());

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut state_rx = client.socket.state();
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                let _ = client
                    .events
                    .send(ClientEvent::ConnectionStateChanged(state));
            }
        });

        // The router: one task decides, one task applies. The unbounded
        // channel between them keeps store mutations in envelope-arrival
        // order.
        let mut envelopes = self
            .socket
            .subscribe(EnvelopePattern::new(SUBSYSTEM_CHAT, Some(ACTION_NEW_MESSAGE)))
            .await;
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = envelopes.recv().await {
                let event = match NewMessageData::from_envelope(&envelope) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(%err, "dropping malformed new_message payload");
                        continue;
                    }
                };
                let Some(viewer) = client.session.user_id().await else {
                    continue;
                };
                let open_id = client.directory.open_id().await;
                let author_known = client.directory.contains(event.author.id).await;
                if let Some(command) = router::decide(viewer, open_id, author_known, &event) {
                    if commands_tx.send(command).is_err() {
                        break;
                    }
                }
            }
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(command) = commands_rx.recv().await {
                client.apply(command).await;
            }
        });
    }

    async fn apply(&self, command: StoreCommand) {
        match command {
            StoreCommand::Deliver {
                message,
                receipt_to,
            } => {
                // The receipt goes out before any store mutation, so the
                // server learns about the read before the UI shows it.
                match self.tokens.access().await {
                    Some(access) => self.socket.send(Envelope::chat_read_receipt(
                        access, receipt_to, message.id,
                    )),
                    None => warn!("no access credential available for read receipt"),
                }
                let appended = self.history.append_realtime(message.clone()).await;
                self.directory.mark_read(receipt_to).await;
                if appended {
                    let _ = self.events.send(ClientEvent::MessageReceived { message });
                }
            }
            StoreCommand::MarkUnread(interlocutor_id) => {
                self.directory.mark_unread(interlocutor_id).await;
                let _ = self.events.send(ClientEvent::UnreadChanged {
                    interlocutor_id,
                    has_unread: true,
                });
            }
            StoreCommand::ReloadDirectory { announce } => {
                // Make the new interlocutor visible immediately; the revision
                // clock keeps the unread flag if the listing response races.
                let interlocutor = announce.interlocutor_id;
                self.directory.append(announce).await;
                self.directory.mark_unread(interlocutor).await;
                if let Err(err) = self.load_chats().await {
                    warn!(%err, "directory reload after unknown interlocutor failed");
                }
            }
        }
    }

    /// Converts an `Unauthenticated` gateway failure into a forced logout;
    /// all other errors pass through for the caller's store to report.
    async fn auth_checked(&self, err: GatewayError) -> anyhow::Error {
        if err.is_unauthenticated() {
            self.force_logout().await;
        }
        err.into()
    }

    async fn force_logout(&self) {
        self.shutdown_session(true).await;
    }

    async fn shutdown_session(&self, expired: bool) {
        self.tokens.clear().await;
        self.session.clear().await;
        self.directory.reset().await;
        self.history.reset().await;
        self.socket.close();
        if expired {
            let _ = self.events.send(ClientEvent::SessionExpired);
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
