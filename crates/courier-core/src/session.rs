//! Session orchestration.
//!
//! [`SessionManager`] owns all per-process connection state (registry,
//! rooms, typing timers) and wires the inbound client events to the
//! persistence, presence and offline-delivery services. The transport layer
//! only has to authenticate, call [`SessionManager::connect`], feed decoded
//! events to [`SessionManager::handle`] and forward the connection's sink to
//! the socket.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::persistence::{new_message, MessagePersistenceService};
use crate::presence::{PresenceStore, PRESENCE_TTL};
use crate::queue::OfflineDeliveryQueue;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::room::{conversation_room, user_room, PRESENCE_ROOM};
use crate::router::{MemberSink, PubSub, RoomRouter, RouterConfig, RouterError};
use crate::store::DurableStore;
use crate::typing::{TypingCoordinator, TYPING_TIMEOUT};
use courier_protocol::{
    ClientEvent, ConversationKind, Message, MessageId, Notification, PresenceRecord,
    PresenceStatus, QueuedNotification, SendMessage, ServerEvent, UserId,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tunables of a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub router: RouterConfig,
    pub typing_timeout: Duration,
    pub presence_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            typing_timeout: TYPING_TIMEOUT,
            presence_ttl: PRESENCE_TTL,
        }
    }
}

/// Status last written for a user's current connection and when.
struct PresenceLease {
    status: PresenceStatus,
    written_at: Instant,
}

/// An authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

/// Coordinates connections, rooms and the messaging services.
pub struct SessionManager {
    registry: ConnectionRegistry,
    router: Arc<RoomRouter>,
    typing: TypingCoordinator,
    presence: PresenceStore,
    queue: OfflineDeliveryQueue,
    persistence: MessagePersistenceService,
    leases: DashMap<UserId, PresenceLease>,
    presence_refresh: Duration,
}

impl SessionManager {
    /// Create a manager with empty connection state.
    #[must_use]
    pub fn new(db: Arc<Database>, store: Arc<dyn DurableStore>) -> Self {
        Self::with_config(db, store, SessionConfig::default())
    }

    #[must_use]
    pub fn with_config(db: Arc<Database>, store: Arc<dyn DurableStore>, config: SessionConfig) -> Self {
        let router = Arc::new(RoomRouter::with_config(config.router));
        let typing = TypingCoordinator::with_timeout(router.clone(), config.typing_timeout);

        Self {
            registry: ConnectionRegistry::new(),
            router,
            typing,
            presence: PresenceStore::new(store.clone()).with_ttl(config.presence_ttl),
            queue: OfflineDeliveryQueue::new(store),
            persistence: MessagePersistenceService::new(db),
            leases: DashMap::new(),
            presence_refresh: config.presence_ttl / 3,
        }
    }

    #[must_use]
    pub fn router(&self) -> &RoomRouter {
        &self.router
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    #[must_use]
    pub fn queue(&self) -> &OfflineDeliveryQueue {
        &self.queue
    }

    #[must_use]
    pub fn persistence(&self) -> &MessagePersistenceService {
        &self.persistence
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring an authenticated connection online.
    ///
    /// Joins the personal and presence rooms, registers the connection as
    /// the user's current one, announces the user as online, and replays
    /// anything queued while they were offline. Only the queue entries whose
    /// replay was accepted by `sink` are removed.
    ///
    /// # Errors
    ///
    /// Fails without registering anything if the rooms cannot be joined,
    /// since the connection could then never receive messages.
    pub async fn connect(&self, user_id: &str, connection_id: ConnectionId, sink: MemberSink) -> Result<Session> {
        self.router.attach(connection_id.clone(), sink);

        for room in [user_room(user_id), PRESENCE_ROOM.to_string()] {
            if let Err(e) = self.router.join(&connection_id, &room) {
                warn!(connection = %connection_id, room = %room, error = %e, "Failed to join room");
                self.router.detach(&connection_id);
                return Err(e.into());
            }
        }

        if let Some(previous) = self.registry.register(user_id, connection_id.clone()) {
            info!(user = %user_id, previous = %previous, "User reconnected; newest connection wins");
        }

        let record = self.write_presence(user_id, PresenceStatus::Online).await;
        self.router.publish(
            PRESENCE_ROOM,
            ServerEvent::UserPresenceUpdated(record),
            Some(&connection_id),
        );

        self.replay_queued(user_id, &connection_id).await;

        info!(user = %user_id, connection = %connection_id, "Session connected");
        Ok(Session {
            user_id: user_id.to_string(),
            connection_id,
        })
    }

    async fn replay_queued(&self, user_id: &str, connection_id: &ConnectionId) {
        let (messages, receipt) = self.queue.take(user_id).await.into_parts();
        if messages.is_empty() {
            // only undecodable entries, if any
            self.queue.acknowledge(&receipt).await;
        } else {
            let count = messages.len();
            if self
                .router
                .send_to(connection_id, ServerEvent::QueuedMessages { messages })
            {
                self.queue.acknowledge(&receipt).await;
                debug!(user = %user_id, count, "Delivered queued messages");
            } else {
                warn!(user = %user_id, count, "Connection closed before queued messages were delivered");
            }
        }

        let (notifications, receipt) = self.queue.take_notifications(user_id).await.into_parts();
        let count = notifications.len();
        let delivered = notifications
            .into_iter()
            .take_while(|n| {
                self.router
                    .send_to(connection_id, ServerEvent::Notification(n.clone()))
            })
            .count();
        if delivered == count {
            self.queue.acknowledge(&receipt).await;
            if count > 0 {
                debug!(user = %user_id, count, "Delivered queued notifications");
            }
        } else {
            warn!(user = %user_id, count, delivered, "Connection closed during notification replay");
        }
    }

    async fn write_presence(&self, user_id: &str, status: PresenceStatus) -> PresenceRecord {
        self.leases.insert(
            user_id.to_string(),
            PresenceLease {
                status,
                written_at: Instant::now(),
            },
        );
        self.presence.set_status(user_id, status).await
    }

    /// Record activity on a connection.
    ///
    /// Rewrites the stored presence record of the user's current connection
    /// once a third of its TTL has passed, so active users never lapse to
    /// offline in the shared store.
    pub async fn touch(&self, session: &Session) {
        if self.registry.lookup(&session.user_id).as_ref() != Some(&session.connection_id) {
            return;
        }
        let due = self
            .leases
            .get(&session.user_id)
            .filter(|lease| lease.written_at.elapsed() >= self.presence_refresh)
            .map(|lease| lease.status);
        if let Some(status) = due {
            self.write_presence(&session.user_id, status).await;
            debug!(user = %session.user_id, "Presence refreshed");
        }
    }

    /// Tear down a connection.
    ///
    /// The user is only marked offline if this was still their current
    /// connection.
    pub async fn disconnect(&self, session: &Session) {
        let Session {
            user_id,
            connection_id,
        } = session;

        let was_current = self.registry.unregister(user_id, connection_id);
        let stopped = self.typing.stop_all_for_connection(user_id, connection_id);
        let rooms = self.router.detach(connection_id);

        if was_current {
            self.leases.remove(user_id);
            let record = self.presence.set_status(user_id, PresenceStatus::Offline).await;
            self.router
                .publish(PRESENCE_ROOM, ServerEvent::UserPresenceUpdated(record), None);
        }

        info!(
            user = %user_id,
            connection = %connection_id,
            rooms = rooms.len(),
            typing_stopped = stopped,
            was_current,
            "Session disconnected"
        );
    }

    /// Cancel all timers and forget every connection. Sends nothing.
    pub fn shutdown(&self) {
        self.typing.shutdown();
        self.registry.clear();
        self.router.clear();
        self.leases.clear();
        info!("Session manager shut down");
    }

    // ========================================================================
    // Inbound events
    // ========================================================================

    /// Process one event from an authenticated connection.
    ///
    /// Failures are reported to that connection only, as `message_error`.
    pub async fn handle(&self, session: &Session, event: ClientEvent) {
        self.touch(session).await;
        let name = event.name();
        if let Err(e) = self.dispatch(session, event).await {
            debug!(
                user = %session.user_id,
                connection = %session.connection_id,
                event = name,
                code = e.code(),
                error = %e,
                "Request failed"
            );
            self.router.send_to(&session.connection_id, e.to_event());
        }
    }

    async fn dispatch(&self, session: &Session, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Connect { .. } => Err(Error::Validation("Already connected".into())),
            ClientEvent::JoinConversation { conversation_id } => {
                self.join_conversation(session, &conversation_id).await
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                self.leave_conversation(session, &conversation_id)
            }
            ClientEvent::SendMessage(request) => self.send_message(session, request).await,
            ClientEvent::MarkMessagesRead {
                conversation_id,
                message_ids,
            } => self.mark_read(session, conversation_id, message_ids).await,
            ClientEvent::TypingStart { conversation_id } => {
                self.require_joined(session, &conversation_id)?;
                self.typing
                    .start(&conversation_id, &session.user_id, &session.connection_id);
                Ok(())
            }
            ClientEvent::TypingStop { conversation_id } => {
                self.require_joined(session, &conversation_id)?;
                self.typing.stop(&conversation_id, &session.user_id);
                Ok(())
            }
            ClientEvent::EditMessage {
                message_id,
                new_content,
            } => self.edit_message(session, &message_id, new_content).await,
            ClientEvent::DeleteMessage { message_id } => self.delete_message(session, &message_id).await,
            ClientEvent::UpdatePresence { status } => {
                let record = self.write_presence(&session.user_id, status).await;
                self.router.publish(
                    PRESENCE_ROOM,
                    ServerEvent::UserPresenceUpdated(record),
                    Some(&session.connection_id),
                );
                Ok(())
            }
            ClientEvent::Ping { timestamp } => {
                self.router
                    .send_to(&session.connection_id, ServerEvent::pong(timestamp));
                Ok(())
            }
        }
    }

    fn require_joined(&self, session: &Session, conversation_id: &str) -> Result<()> {
        if self
            .router
            .is_member(&session.connection_id, &conversation_room(conversation_id))
        {
            Ok(())
        } else {
            Err(Error::Forbidden("Join the conversation first".into()))
        }
    }

    async fn join_conversation(&self, session: &Session, conversation_id: &str) -> Result<()> {
        if !self
            .persistence
            .is_participant(conversation_id, &session.user_id)
            .await?
        {
            return Err(Error::Forbidden("Not a participant of this conversation".into()));
        }

        let joined = self
            .router
            .join(&session.connection_id, &conversation_room(conversation_id))?;
        debug!(user = %session.user_id, conversation = %conversation_id, joined, "Joined conversation");
        Ok(())
    }

    fn leave_conversation(&self, session: &Session, conversation_id: &str) -> Result<()> {
        self.typing.stop(conversation_id, &session.user_id);
        match self
            .router
            .leave(&session.connection_id, &conversation_room(conversation_id))
        {
            Ok(()) | Err(RouterError::NotMember(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_message(&self, session: &Session, request: SendMessage) -> Result<()> {
        let client_ref = request.client_ref.clone();
        let new = new_message(&session.user_id, request)?;
        let (message, conversation) = self.persistence.create_message(new).await?;

        self.typing.stop(&conversation.id, &session.user_id);

        self.router.send_to(
            &session.connection_id,
            ServerEvent::MessageSent {
                message: message.clone(),
                client_ref,
            },
        );

        for participant in conversation.others(&session.user_id) {
            let delivered = self.router.publish(
                &user_room(participant),
                ServerEvent::NewMessage {
                    message: message.clone(),
                },
                None,
            );
            debug!(message = %message.id, recipient = %participant, delivered, "Message fanned out");
        }

        if conversation.kind == ConversationKind::Direct {
            self.enqueue_if_offline(&message).await;
        }
        Ok(())
    }

    async fn enqueue_if_offline(&self, message: &Message) {
        let Some(recipient) = message.recipient_id.as_deref() else {
            return;
        };
        if !self.registry.is_online(recipient) {
            self.queue.enqueue(recipient, message).await;
        }
    }

    async fn mark_read(
        &self,
        session: &Session,
        conversation_id: String,
        message_ids: Vec<MessageId>,
    ) -> Result<()> {
        let (marked, read_at) = self
            .persistence
            .mark_read(&conversation_id, &session.user_id, message_ids)
            .await?;

        if !marked.is_empty() {
            self.router.publish(
                &conversation_room(&conversation_id),
                ServerEvent::MessagesRead {
                    conversation_id: conversation_id.clone(),
                    user_id: session.user_id.clone(),
                    message_ids: marked.clone(),
                    read_at,
                },
                Some(&session.connection_id),
            );
        }

        self.router.send_to(
            &session.connection_id,
            ServerEvent::MessagesMarkedRead {
                conversation_id,
                message_ids: marked,
            },
        );
        Ok(())
    }

    async fn edit_message(&self, session: &Session, message_id: &str, new_content: String) -> Result<()> {
        let message = self
            .persistence
            .edit_message(message_id, &session.user_id, new_content)
            .await?;

        self.router.publish(
            &conversation_room(&message.conversation_id),
            ServerEvent::MessageUpdated {
                message: message.clone(),
            },
            Some(&session.connection_id),
        );
        self.router
            .send_to(&session.connection_id, ServerEvent::MessageUpdated { message });
        Ok(())
    }

    async fn delete_message(&self, session: &Session, message_id: &str) -> Result<()> {
        let (message_id, conversation_id) = self
            .persistence
            .delete_message(message_id, &session.user_id)
            .await?;

        self.router.publish(
            &conversation_room(&conversation_id),
            ServerEvent::MessageDeleted {
                message_id: message_id.clone(),
                conversation_id: conversation_id.clone(),
            },
            Some(&session.connection_id),
        );
        self.router.send_to(
            &session.connection_id,
            ServerEvent::MessageDeleted {
                message_id,
                conversation_id,
            },
        );
        Ok(())
    }

    // ========================================================================
    // Out-of-band
    // ========================================================================

    /// Deliver a notification to the user's live connection, or queue it.
    ///
    /// Returns `true` if it was delivered live.
    pub async fn notify(&self, user_id: &str, notification: Notification) -> bool {
        if let Some(connection) = self.registry.lookup(user_id) {
            let live = ServerEvent::Notification(QueuedNotification {
                notification: notification.clone(),
                queued_at: None,
            });
            if self.router.send_to(&connection, live) {
                return true;
            }
        }
        self.queue.enqueue_notification(user_id, notification).await;
        false
    }

    /// Presence of a user. A live connection on this process counts as
    /// online even if the stored record has lapsed.
    pub async fn presence_of(&self, user_id: &str) -> PresenceRecord {
        let record = self.presence.get_status(user_id).await;
        if self.registry.is_online(user_id) && !record.is_online {
            return PresenceRecord::now(user_id, PresenceStatus::Online);
        }
        record
    }

    /// Users with a live connection on this process.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.registry.list_online()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.typing.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::message_queue_key;
    use crate::room::MAX_ROOM_NAME_LENGTH;
    use crate::router::Outbound;
    use crate::store::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(MemoryStore::new()),
        )
    }

    async fn connect(manager: &SessionManager, user: &str) -> (Session, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = manager
            .connect(user, ConnectionId::new(format!("conn_{}", user)), tx)
            .await
            .unwrap();
        (session, rx)
    }

    fn received(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn names(events: &[ServerEvent]) -> Vec<&'static str> {
        events.iter().map(ServerEvent::name).collect()
    }

    async fn send_direct(manager: &SessionManager, from: &Session, to: &str, content: &str) {
        manager
            .handle(from, ClientEvent::SendMessage(SendMessage::direct(to, content)))
            .await;
    }

    fn sent_message(events: &[ServerEvent]) -> Message {
        events
            .iter()
            .find_map(|event| match event {
                ServerEvent::MessageSent { message, .. } => Some(message.clone()),
                _ => None,
            })
            .expect("message_sent")
    }

    #[tokio::test]
    async fn test_offline_message_queued_then_drained_once() {
        let manager = manager();
        let (bob, mut bob_rx) = connect(&manager, "bob").await;

        send_direct(&manager, &bob, "alice", "hi").await;
        assert_eq!(names(&received(&mut bob_rx)), vec!["message_sent"]);

        let queued = manager.queue().drain("alice").await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].content, "hi");

        let (_alice, mut alice_rx) = connect(&manager, "alice").await;
        let events = received(&mut alice_rx);
        match &events[..] {
            [ServerEvent::QueuedMessages { messages }] => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "hi");
            }
            other => panic!("Expected queued_messages, got {:?}", other),
        }

        assert!(manager.queue().drain("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_kept_when_sink_closed() {
        let manager = manager();
        let (bob, _bob_rx) = connect(&manager, "bob").await;
        send_direct(&manager, &bob, "alice", "hi").await;

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        manager
            .connect("alice", ConnectionId::new("conn_dead"), tx)
            .await
            .unwrap();

        assert_eq!(manager.queue().count("alice").await, 1);
    }

    /// Appends a copy of the head entry right after a message queue is read,
    /// like an enqueue from another process landing mid-replay.
    struct LateEnqueueStore {
        inner: MemoryStore,
        fired: AtomicBool,
    }

    #[async_trait]
    impl DurableStore for LateEnqueueStore {
        async fn push_back(&self, key: &str, value: String, ttl: Duration) -> StoreResult<usize> {
            self.inner.push_back(key, value, ttl).await
        }

        async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
            let values = self.inner.range(key).await?;
            if key.starts_with("message_queue:")
                && !values.is_empty()
                && !self.fired.swap(true, Ordering::SeqCst)
            {
                self.inner
                    .push_back(key, values[0].clone(), Duration::from_secs(60))
                    .await?;
            }
            Ok(values)
        }

        async fn len(&self, key: &str) -> StoreResult<usize> {
            self.inner.len(key).await
        }

        async fn trim_front(&self, key: &str, count: usize) -> StoreResult<usize> {
            self.inner.trim_front(key, count).await
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn purge_expired(&self) -> StoreResult<usize> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn test_replay_keeps_messages_queued_during_replay() {
        let store = Arc::new(LateEnqueueStore {
            inner: MemoryStore::new(),
            fired: AtomicBool::new(false),
        });
        let manager = SessionManager::new(Arc::new(Database::open_in_memory().unwrap()), store.clone());
        let (bob, _bob_rx) = connect(&manager, "bob").await;
        send_direct(&manager, &bob, "alice", "hi").await;

        let (_alice, mut alice_rx) = connect(&manager, "alice").await;
        match &received(&mut alice_rx)[..] {
            [ServerEvent::QueuedMessages { messages }] => assert_eq!(messages.len(), 1),
            other => panic!("Expected queued_messages, got {:?}", other),
        }

        assert_eq!(store.inner.len(&message_queue_key("alice")).await.unwrap(), 1);
        assert_eq!(manager.queue().count("alice").await, 1);
    }

    #[tokio::test]
    async fn test_non_ascii_user_receives_messages() {
        let manager = manager();
        let (_jose, mut jose_rx) = connect(&manager, "josé").await;
        let (bob, _bob_rx) = connect(&manager, "bob").await;
        received(&mut jose_rx);

        send_direct(&manager, &bob, "josé", "hi").await;
        match &received(&mut jose_rx)[..] {
            [ServerEvent::NewMessage { message }] => assert_eq!(message.content, "hi"),
            other => panic!("Expected new_message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_fails_when_personal_room_is_unusable() {
        let manager = manager();
        let user = "u".repeat(MAX_ROOM_NAME_LENGTH);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = manager.connect(&user, ConnectionId::new("conn_long"), tx).await;
        assert!(matches!(result, Err(Error::Router(RouterError::InvalidRoom(_)))));
        assert!(!manager.registry().is_online(&user));
        assert!(!manager.router().is_attached(&ConnectionId::new("conn_long")));

        // with no registry entry, direct messages are queued instead of lost
        let (bob, _bob_rx) = connect(&manager, "bob").await;
        send_direct(&manager, &bob, &user, "hi").await;
        assert_eq!(manager.queue().count(&user).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_stored_presence_fresh() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(Arc::new(Database::open_in_memory().unwrap()), store.clone());
        let observer = PresenceStore::new(store);
        let (alice, _alice_rx) = connect(&manager, "alice").await;
        let (idle, _idle_rx) = connect(&manager, "idle").await;

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(60)).await;
            manager.handle(&alice, ClientEvent::Ping { timestamp: None }).await;
        }

        assert!(observer.get_status("alice").await.is_online);
        assert!(!observer.get_status(&idle.user_id).await.is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_chosen_status() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(Arc::new(Database::open_in_memory().unwrap()), store.clone());
        let observer = PresenceStore::new(store);
        let (alice, _alice_rx) = connect(&manager, "alice").await;

        manager
            .handle(&alice, ClientEvent::UpdatePresence { status: PresenceStatus::Away })
            .await;
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(60)).await;
            manager.touch(&alice).await;
        }

        assert_eq!(observer.get_status("alice").await.status, PresenceStatus::Away);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_disconnect_keeps_new_connection_typing() {
        let manager = manager();
        let (old, _old_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;
        send_direct(&manager, &bob, "alice", "hi").await;
        let conversation_id = sent_message(&received(&mut bob_rx)).conversation_id;

        let (tx, _new_rx) = mpsc::unbounded_channel();
        let new = manager
            .connect("alice", ConnectionId::new("conn_alice_2"), tx)
            .await
            .unwrap();
        manager
            .handle(&new, ClientEvent::join(conversation_id.clone()))
            .await;
        manager
            .handle(&new, ClientEvent::typing_start(conversation_id.clone()))
            .await;

        manager.disconnect(&old).await;
        assert!(manager.typing().is_typing(&conversation_id, "alice"));

        manager.disconnect(&new).await;
        assert!(!manager.typing().is_typing(&conversation_id, "alice"));
    }

    #[tokio::test]
    async fn test_online_recipient_gets_new_message() {
        let manager = manager();
        let (alice, mut alice_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;
        received(&mut alice_rx);

        let mut request = SendMessage::direct("alice", "hello");
        request.client_ref = Some("tmp-1".into());
        manager.handle(&bob, ClientEvent::SendMessage(request)).await;

        match &received(&mut bob_rx)[..] {
            [ServerEvent::MessageSent { message, client_ref }] => {
                assert_eq!(message.content, "hello");
                assert_eq!(client_ref.as_deref(), Some("tmp-1"));
            }
            other => panic!("Expected message_sent, got {:?}", other),
        }
        assert_eq!(names(&received(&mut alice_rx)), vec!["new_message"]);
        assert_eq!(manager.queue().count(&alice.user_id).await, 0);
    }

    #[tokio::test]
    async fn test_presence_broadcast_on_connect_and_disconnect() {
        let manager = manager();
        let (_alice, mut alice_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;

        match &received(&mut alice_rx)[..] {
            [ServerEvent::UserPresenceUpdated(record)] => {
                assert_eq!(record.user_id, "bob");
                assert!(record.is_online);
            }
            other => panic!("Expected presence update, got {:?}", other),
        }
        // no echo of one's own presence
        assert!(received(&mut bob_rx).is_empty());

        manager.disconnect(&bob).await;
        match &received(&mut alice_rx)[..] {
            [ServerEvent::UserPresenceUpdated(record)] => {
                assert_eq!(record.user_id, "bob");
                assert_eq!(record.status, PresenceStatus::Offline);
            }
            other => panic!("Expected presence update, got {:?}", other),
        }
        assert!(!manager.presence_of("bob").await.is_online);
        assert_eq!(manager.online_users(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_user_online() {
        let manager = manager();
        let (old, _old_rx) = connect(&manager, "alice").await;

        let (tx, _new_rx) = mpsc::unbounded_channel();
        let new = manager
            .connect("alice", ConnectionId::new("conn_alice_2"), tx)
            .await
            .unwrap();

        manager.disconnect(&old).await;
        assert_eq!(manager.registry().lookup("alice"), Some(new.connection_id.clone()));
        assert!(manager.presence_of("alice").await.is_online);

        manager.disconnect(&new).await;
        assert!(!manager.presence_of("alice").await.is_online);
    }

    #[tokio::test]
    async fn test_read_receipts_flow() {
        let manager = manager();
        let (alice, mut alice_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;

        send_direct(&manager, &bob, "alice", "hi").await;
        let message = sent_message(&received(&mut bob_rx));
        received(&mut alice_rx);

        for session in [&alice, &bob] {
            manager
                .handle(session, ClientEvent::join(message.conversation_id.clone()))
                .await;
        }
        assert!(received(&mut alice_rx).is_empty());

        let read = ClientEvent::MarkMessagesRead {
            conversation_id: message.conversation_id.clone(),
            message_ids: vec![message.id.clone(), message.id.clone()],
        };
        manager.handle(&alice, read.clone()).await;

        match &received(&mut alice_rx)[..] {
            [ServerEvent::MessagesMarkedRead { message_ids, .. }] => {
                assert_eq!(message_ids, &vec![message.id.clone()]);
            }
            other => panic!("Expected messages_marked_read, got {:?}", other),
        }
        match &received(&mut bob_rx)[..] {
            [ServerEvent::MessagesRead { user_id, message_ids, .. }] => {
                assert_eq!(user_id, "alice");
                assert_eq!(message_ids, &vec![message.id.clone()]);
            }
            other => panic!("Expected messages_read, got {:?}", other),
        }

        // second read adds nothing, so nothing is broadcast
        manager.handle(&alice, read).await;
        assert_eq!(names(&received(&mut alice_rx)), vec!["messages_marked_read"]);
        assert!(received(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_edit_by_non_owner_matches_missing() {
        let manager = manager();
        let (alice, mut alice_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;

        send_direct(&manager, &bob, "alice", "hi").await;
        let message = sent_message(&received(&mut bob_rx));
        received(&mut alice_rx);

        let edit = |message_id: &str| ClientEvent::EditMessage {
            message_id: message_id.to_string(),
            new_content: "hacked".into(),
        };
        manager.handle(&alice, edit(&message.id)).await;
        manager.handle(&alice, edit("missing")).await;

        let errors = received(&mut alice_rx);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], errors[1]);
        assert_eq!(errors[0], ServerEvent::error(4004, "Message not found or access denied"));
        assert!(received(&mut bob_rx).is_empty());

        let history = manager
            .persistence()
            .conversation_messages(&message.conversation_id, "bob", None, None)
            .await
            .unwrap();
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_edit_and_delete_reach_room_and_actor() {
        let manager = manager();
        let (alice, mut alice_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;

        send_direct(&manager, &bob, "alice", "hi").await;
        let message = sent_message(&received(&mut bob_rx));
        for session in [&alice, &bob] {
            manager
                .handle(session, ClientEvent::join(message.conversation_id.clone()))
                .await;
        }
        received(&mut alice_rx);

        manager
            .handle(
                &bob,
                ClientEvent::EditMessage {
                    message_id: message.id.clone(),
                    new_content: "hello".into(),
                },
            )
            .await;
        assert_eq!(names(&received(&mut bob_rx)), vec!["message_updated"]);
        assert_eq!(names(&received(&mut alice_rx)), vec!["message_updated"]);

        manager
            .handle(&bob, ClientEvent::DeleteMessage { message_id: message.id.clone() })
            .await;
        assert_eq!(names(&received(&mut bob_rx)), vec!["message_deleted"]);
        assert_eq!(names(&received(&mut alice_rx)), vec!["message_deleted"]);
    }

    #[tokio::test]
    async fn test_join_requires_participation() {
        let manager = manager();
        let (bob, mut bob_rx) = connect(&manager, "bob").await;
        let (eve, mut eve_rx) = connect(&manager, "eve").await;

        send_direct(&manager, &bob, "alice", "hi").await;
        let message = sent_message(&received(&mut bob_rx));
        received(&mut eve_rx);

        manager
            .handle(&eve, ClientEvent::join(message.conversation_id.clone()))
            .await;
        match &received(&mut eve_rx)[..] {
            [ServerEvent::MessageError { code, .. }] => assert_eq!(*code, 4003),
            other => panic!("Expected message_error, got {:?}", other),
        }
        assert!(!manager
            .router()
            .is_member(&eve.connection_id, &conversation_room(&message.conversation_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_requires_join_and_expires() {
        let manager = manager();
        let (alice, mut alice_rx) = connect(&manager, "alice").await;
        let (bob, mut bob_rx) = connect(&manager, "bob").await;

        send_direct(&manager, &bob, "alice", "hi").await;
        let message = sent_message(&received(&mut bob_rx));
        let conversation_id = message.conversation_id;

        manager
            .handle(&bob, ClientEvent::typing_start(conversation_id.clone()))
            .await;
        match &received(&mut bob_rx)[..] {
            [ServerEvent::MessageError { code, .. }] => assert_eq!(*code, 4003),
            other => panic!("Expected message_error, got {:?}", other),
        }

        for session in [&alice, &bob] {
            manager
                .handle(session, ClientEvent::join(conversation_id.clone()))
                .await;
        }
        received(&mut alice_rx);

        manager
            .handle(&bob, ClientEvent::typing_start(conversation_id.clone()))
            .await;
        assert_eq!(
            received(&mut alice_rx),
            vec![ServerEvent::typing(conversation_id.clone(), "bob", true)]
        );

        tokio::time::sleep(TYPING_TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(
            received(&mut alice_rx),
            vec![ServerEvent::typing(conversation_id, "bob", false)]
        );
        assert!(received(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_notify_live_or_queued() {
        let manager = manager();
        let (_alice, mut alice_rx) = connect(&manager, "alice").await;
        let notification = Notification {
            id: "n1".into(),
            kind: "mention".into(),
            title: "Mention".into(),
            body: "bob mentioned you".into(),
            data: serde_json::Value::Null,
            created_at: 1,
        };

        assert!(manager.notify("alice", notification.clone()).await);
        assert_eq!(names(&received(&mut alice_rx)), vec!["notification"]);

        assert!(!manager.notify("carol", notification).await);
        let (_carol, mut carol_rx) = connect(&manager, "carol").await;
        assert_eq!(names(&received(&mut carol_rx)), vec!["notification"]);
        assert_eq!(manager.queue().notification_count("carol").await, 0);
    }

    #[tokio::test]
    async fn test_ping_and_repeated_connect() {
        let manager = manager();
        let (alice, mut alice_rx) = connect(&manager, "alice").await;

        manager
            .handle(&alice, ClientEvent::Ping { timestamp: Some(7) })
            .await;
        manager.handle(&alice, ClientEvent::connect("token")).await;

        let events = received(&mut alice_rx);
        assert_eq!(events[0], ServerEvent::pong(Some(7)));
        assert!(matches!(events[1], ServerEvent::MessageError { code: 4000, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let manager = manager();
        let (_alice, _alice_rx) = connect(&manager, "alice").await;

        manager.shutdown();
        assert!(manager.online_users().is_empty());
        assert_eq!(manager.router().stats().connection_count, 0);
    }
}
