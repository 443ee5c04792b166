//! Channel runtime: a single tokio task that owns the chat session and
//! drives the WebSocket transport, reconnect timer and periodic sync, plus
//! the REST clients for sync and the room directory.

use std::{sync::Arc, time::Duration};

use chat_core::{
    ChannelError, ChatChannels, ChatCommand, ChatError, EventStream, NewRoom, ReconnectPolicy,
};
use chat_platform::KeyValueStore;
use url::Url;
use uuid::Uuid;

mod http;
mod identity;
mod rooms_client;
mod runtime;
mod session;
mod sync_client;
mod transport;

pub use identity::{IdentityProvider, StaticIdentity};
pub use rooms_client::{HttpRoomsClient, RoomsClient};
pub use session::Session;
pub use sync_client::{HttpSyncClient, SyncClient};
pub use transport::{
    Connector, OutboundText, TransportConnection, TransportError, TransportIncoming,
    WebSocketConnector,
};

use runtime::ChatRuntime;

const DEFAULT_STORAGE_NAMESPACE: &str = "chat";

/// Timing and buffer settings for the runtime.
#[derive(Debug, Clone)]
pub struct ChatRuntimeConfig {
    pub reconnect_policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub sync_interval: Duration,
    pub sync_timeout: Duration,
    /// Upper bound for one room directory request.
    pub request_timeout: Duration,
    /// Whether periodic sync runs before the first `SetForeground`.
    pub start_foreground: bool,
    /// Namespace the session snapshot is stored under.
    pub storage_namespace: String,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for ChatRuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect_policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(15),
            start_foreground: true,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_owned(),
            command_buffer: 128,
            event_buffer: 512,
        }
    }
}

/// Server endpoints for the production transport and REST clients.
#[derive(Debug, Clone)]
pub struct ChatEndpoints {
    pub ws_url: Url,
    pub api_base: Url,
}

/// Collaborators injected into the runtime.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub connector: Arc<dyn Connector>,
    pub sync_client: Arc<dyn SyncClient>,
    pub rooms_client: Arc<dyn RoomsClient>,
    pub storage: Arc<dyn KeyValueStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl RuntimeDeps {
    /// WebSocket transport and HTTP clients against `endpoints`.
    pub fn networked(
        endpoints: &ChatEndpoints,
        storage: Arc<dyn KeyValueStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, ChatError> {
        Ok(Self {
            connector: Arc::new(WebSocketConnector::new(endpoints.ws_url.clone())),
            sync_client: Arc::new(HttpSyncClient::new(&endpoints.api_base)?),
            rooms_client: Arc::new(HttpRoomsClient::new(&endpoints.api_base)?),
            storage,
            identity,
        })
    }
}

/// Caller side of a running chat runtime. Dropping every clone stops it.
#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub async fn open(&self) -> Result<(), ChannelError> {
        self.send(ChatCommand::Open).await
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        self.send(ChatCommand::Close).await
    }

    pub async fn join_room(&self, room_id: impl Into<String>) -> Result<(), ChannelError> {
        self.send(ChatCommand::JoinRoom {
            room_id: room_id.into(),
        })
        .await
    }

    pub async fn leave_room(&self, room_id: impl Into<String>) -> Result<(), ChannelError> {
        self.send(ChatCommand::LeaveRoom {
            room_id: room_id.into(),
        })
        .await
    }

    /// Send a message under a fresh time-ordered id and return that id.
    pub async fn send_message(
        &self,
        room_id: impl Into<String>,
        text: impl Into<String>,
        attachments: Vec<String>,
    ) -> Result<String, ChannelError> {
        let message_id = Uuid::now_v7().to_string();
        self.send(ChatCommand::SendMessage {
            room_id: room_id.into(),
            message_id: message_id.clone(),
            text: text.into(),
            attachments,
        })
        .await?;
        Ok(message_id)
    }

    pub async fn load_messages(&self, room_id: impl Into<String>) -> Result<(), ChannelError> {
        self.send(ChatCommand::LoadMessages {
            room_id: room_id.into(),
        })
        .await
    }

    /// `None` asks for the default window.
    pub async fn load_recent_messages(
        &self,
        room_id: impl Into<String>,
        limit: Option<usize>,
    ) -> Result<(), ChannelError> {
        self.send(ChatCommand::LoadRecentMessages {
            room_id: room_id.into(),
            limit,
        })
        .await
    }

    pub async fn list_rooms(&self) -> Result<(), ChannelError> {
        self.send(ChatCommand::ListRooms).await
    }

    pub async fn create_room(&self, room: NewRoom) -> Result<(), ChannelError> {
        self.send(ChatCommand::CreateRoom { room }).await
    }

    pub async fn room_info(&self, room_id: impl Into<String>) -> Result<(), ChannelError> {
        self.send(ChatCommand::FetchRoomInfo {
            room_id: room_id.into(),
        })
        .await
    }

    pub async fn sync_now(&self) -> Result<(), ChannelError> {
        self.send(ChatCommand::SyncNow).await
    }

    pub async fn set_foreground(&self, foreground: bool) -> Result<(), ChannelError> {
        self.send(ChatCommand::SetForeground { foreground }).await
    }
}

/// Restore the session from storage and start the runtime task.
///
/// Must be called from within a tokio runtime.
pub fn spawn_runtime(config: ChatRuntimeConfig, deps: RuntimeDeps) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(config.command_buffer, config.event_buffer);
    let session = Session::load(Arc::clone(&deps.storage), &config.storage_namespace);
    let runtime = ChatRuntime::new(config, channels.event_sender(), command_rx, deps, session);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;
    use chat_core::{
        ChatErrorCategory, ChatEvent, Message, RoomInfo, Sender, SyncCursor, SyncRequest,
        SyncResponse, SyncRoomBatch,
    };
    use chat_platform::{InMemoryKeyValueStore, StorageError};
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use tokio::{sync::mpsc, task::JoinHandle, time::timeout};

    use super::*;

    const ROOM: &str = "park-walk";
    const WAIT: Duration = Duration::from_secs(2);

    enum ConnectScript {
        Accept,
        /// Accept, then fail the socket write after this many frames.
        AcceptFailingAfter(usize),
        /// Accept and write frames without ever confirming them.
        AcceptUnconfirmed,
        Fail,
        Hang,
    }

    const WRITE_FAILED: &str = "write failed";

    /// Server side of an accepted scripted connection.
    struct Peer {
        sent: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::UnboundedSender<TransportIncoming>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> Value {
            let raw = timeout(WAIT, self.sent.recv())
                .await
                .expect("frame timeout")
                .expect("runtime should still be writing");
            serde_json::from_str(&raw).expect("outbound frame is json")
        }

        fn push(&self, frame: Value) {
            self.inbound
                .send(TransportIncoming::Text(frame.to_string()))
                .expect("runtime should still be reading");
        }
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<ConnectScript>>,
        peers: mpsc::UnboundedSender<Peer>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<TransportConnection, TransportError> {
            let next = self
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(ConnectScript::Fail);
            match next {
                ConnectScript::Accept => Ok(self.accept(None, true)),
                ConnectScript::AcceptFailingAfter(budget) => Ok(self.accept(Some(budget), true)),
                ConnectScript::AcceptUnconfirmed => Ok(self.accept(None, false)),
                ConnectScript::Fail => Err(TransportError::Connection("refused".to_owned())),
                ConnectScript::Hang => std::future::pending().await,
            }
        }
    }

    impl ScriptedConnector {
        fn accept(&self, write_budget: Option<usize>, confirm_writes: bool) -> TransportConnection {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (wire_tx, wire_rx) = mpsc::unbounded_channel();
            let task = spawn_wire(
                outbound_rx,
                wire_tx,
                inbound_tx.clone(),
                write_budget,
                confirm_writes,
            );
            let _ = self.peers.send(Peer {
                sent: wire_rx,
                inbound: inbound_tx,
            });
            TransportConnection::new(outbound_tx, inbound_rx, Some(task))
        }
    }

    /// Stand-in for the socket task: forwards frames to the peer and
    /// confirms tracked writes. A dropped peer closes the connection.
    fn spawn_wire(
        mut outbound: mpsc::UnboundedReceiver<OutboundText>,
        wire: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedSender<TransportIncoming>,
        mut write_budget: Option<usize>,
        confirm_writes: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = outbound.recv() => {
                        let Some(frame) = frame else {
                            break;
                        };
                        if write_budget == Some(0) {
                            let _ = inbound.send(TransportIncoming::Closed {
                                reason: Some(WRITE_FAILED.to_owned()),
                            });
                            break;
                        }
                        if wire.send(frame.text).is_err() {
                            let _ = inbound.send(TransportIncoming::Closed { reason: None });
                            break;
                        }
                        if let Some(budget) = write_budget.as_mut() {
                            *budget -= 1;
                        }
                        if let (Some(receipt), true) = (frame.receipt, confirm_writes) {
                            let _ = inbound.send(TransportIncoming::Written { receipt });
                        }
                    }
                    _ = wire.closed() => {
                        let _ = inbound.send(TransportIncoming::Closed { reason: None });
                        break;
                    }
                }
            }
        })
    }

    #[derive(Default)]
    struct ScriptedSyncClient {
        responses: Mutex<VecDeque<Result<SyncResponse, ChatError>>>,
        requests: Mutex<Vec<SyncRequest>>,
    }

    impl ScriptedSyncClient {
        fn push(&self, response: Result<SyncResponse, ChatError>) {
            self.responses
                .lock()
                .expect("responses lock")
                .push_back(response);
        }

        fn requests(&self) -> Vec<SyncRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl SyncClient for ScriptedSyncClient {
        async fn fetch(&self, request: &SyncRequest) -> Result<SyncResponse, ChatError> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or_else(|| Ok(SyncResponse::default()))
        }
    }

    #[derive(Default)]
    struct ScriptedRoomsClient {
        rooms: Mutex<Vec<RoomInfo>>,
    }

    fn room_info(id: &str, name: &str) -> RoomInfo {
        RoomInfo {
            id: id.into(),
            name: Some(name.into()),
            description: None,
            extra: Default::default(),
        }
    }

    #[async_trait]
    impl RoomsClient for ScriptedRoomsClient {
        async fn list_rooms(&self) -> Result<Vec<RoomInfo>, ChatError> {
            Ok(self.rooms.lock().expect("rooms lock").clone())
        }

        async fn create_room(&self, room: &NewRoom) -> Result<RoomInfo, ChatError> {
            let created = room_info(&room.name.to_lowercase().replace(' ', "-"), &room.name);
            self.rooms.lock().expect("rooms lock").push(created.clone());
            Ok(created)
        }

        async fn room_info(&self, room_id: &str) -> Result<RoomInfo, ChatError> {
            self.rooms
                .lock()
                .expect("rooms lock")
                .iter()
                .find(|room| room.id == room_id)
                .cloned()
                .ok_or_else(|| {
                    ChatError::new(
                        ChatErrorCategory::NotFound,
                        "rooms_not_found",
                        format!("room '{room_id}' does not exist"),
                    )
                })
        }
    }

    /// Reads succeed with nothing stored; every write fails.
    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn set_value(&self, _: &str, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk full".into()))
        }

        fn get_value(&self, _: &str, _: &str) -> Result<String, StorageError> {
            Err(StorageError::NotFound)
        }

        fn delete_value(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::NotFound)
        }
    }

    struct Harness {
        handle: ChatRuntimeHandle,
        events: EventStream,
        peers: mpsc::UnboundedReceiver<Peer>,
        sync: Arc<ScriptedSyncClient>,
        storage: Arc<dyn KeyValueStore>,
    }

    impl Harness {
        fn start(script: Vec<ConnectScript>) -> Self {
            Self::start_with(script, test_config(), Arc::new(InMemoryKeyValueStore::default()))
        }

        fn start_with(
            script: Vec<ConnectScript>,
            config: ChatRuntimeConfig,
            storage: Arc<dyn KeyValueStore>,
        ) -> Self {
            let (peers_tx, peers) = mpsc::unbounded_channel();
            let sync = Arc::new(ScriptedSyncClient::default());
            let deps = RuntimeDeps {
                connector: Arc::new(ScriptedConnector {
                    script: Mutex::new(script.into()),
                    peers: peers_tx,
                }),
                sync_client: sync.clone(),
                rooms_client: Arc::new(ScriptedRoomsClient {
                    rooms: Mutex::new(vec![room_info(ROOM, "Park walk")]),
                }),
                storage: Arc::clone(&storage),
                identity: Arc::new(StaticIdentity::new(Sender::new("me", "Walker"))),
            };
            let handle = spawn_runtime(config, deps);
            let events = handle.subscribe();
            Self {
                handle,
                events,
                peers,
                sync,
                storage,
            }
        }

        async fn next_event(&mut self) -> ChatEvent {
            timeout(WAIT, self.events.recv())
                .await
                .expect("event timeout")
                .expect("event receive")
        }

        async fn expect_quiet(&mut self, window: Duration) {
            if let Ok(event) = timeout(window, self.events.recv()).await {
                panic!("unexpected event: {event:?}");
            }
        }

        async fn next_peer(&mut self) -> Peer {
            timeout(WAIT, self.peers.recv())
                .await
                .expect("connect timeout")
                .expect("connector alive")
        }

        async fn connect(&mut self) -> Peer {
            self.handle.open().await.expect("open");
            assert_eq!(self.next_event().await, ChatEvent::Connecting { attempt: 0 });
            assert_eq!(self.next_event().await, ChatEvent::Connected);
            self.next_peer().await
        }

        async fn send(&self, command: ChatCommand) {
            self.handle.send(command).await.expect("command should enqueue");
        }
    }

    fn test_config() -> ChatRuntimeConfig {
        ChatRuntimeConfig {
            reconnect_policy: ReconnectPolicy::new(10, 2),
            connect_timeout: Duration::from_millis(200),
            sync_interval: Duration::from_secs(3_600),
            sync_timeout: Duration::from_millis(200),
            start_foreground: false,
            ..ChatRuntimeConfig::default()
        }
    }

    fn server_message(id: &str, author: &str, text: &str) -> Message {
        Message::new(
            id,
            Sender::new(author, author),
            text,
            Utc.with_ymd_and_hms(2024, 6, 2, 8, 30, 0).unwrap(),
        )
    }

    fn chat_frame(id: &str, author: &str, text: &str) -> Value {
        json!({
            "type": "chat_message",
            "roomId": ROOM,
            "message": server_message(id, author, text),
        })
    }

    #[tokio::test]
    async fn offline_messages_drain_in_order_after_room_announcements() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        h.handle.join_room(ROOM).await.expect("join");

        let first = h.handle.send_message(ROOM, "first", vec![]).await.expect("send");
        let second = h.handle.send_message(ROOM, "second", vec![]).await.expect("send");
        for expected in [&first, &second] {
            match h.next_event().await {
                ChatEvent::NewMessage { message, .. } => assert_eq!(&message.id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
            match h.next_event().await {
                ChatEvent::MessageQueued { message_id, .. } => assert_eq!(&message_id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        let mut peer = h.connect().await;
        assert_eq!(
            h.next_event().await,
            ChatEvent::QueueDrained {
                sent: 2,
                remaining: 0
            }
        );

        assert_eq!(
            peer.next_frame().await,
            json!({"type": "join_room", "roomId": ROOM})
        );
        let drained_a = peer.next_frame().await;
        let drained_b = peer.next_frame().await;
        assert_eq!(drained_a["type"], "chat_message");
        assert_eq!(drained_a["message"]["id"], first.as_str());
        assert_eq!(drained_a["message"]["text"], "first");
        assert_eq!(drained_b["message"]["id"], second.as_str());
    }

    #[tokio::test]
    async fn connected_send_goes_straight_to_the_wire() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        let mut peer = h.connect().await;

        let id = h
            .handle
            .send_message(ROOM, "woof", vec!["photo-1".into()])
            .await
            .expect("send");
        match h.next_event().await {
            ChatEvent::NewMessage { room_id, message } => {
                assert_eq!(room_id, ROOM);
                assert_eq!(message.room_id.as_deref(), Some(ROOM));
                assert_eq!(message.sender.id, "me");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let frame = peer.next_frame().await;
        assert_eq!(frame["message"]["id"], id.as_str());
        assert_eq!(frame["message"]["attachments"], json!(["photo-1"]));
        h.expect_quiet(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn duplicate_and_unknown_inbound_frames_are_dropped() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        let peer = h.connect().await;

        peer.push(json!({"type": "walk_started", "roomId": ROOM}));
        peer.inbound
            .send(TransportIncoming::Text("not json".into()))
            .expect("runtime reading");
        peer.push(chat_frame("s1", "rex", "hello"));
        peer.push(chat_frame("s1", "rex", "hello"));
        peer.push(json!({
            "type": "user_joined",
            "roomId": ROOM,
            "user": {"id": "rex", "name": "Rex"},
        }));

        match h.next_event().await {
            ChatEvent::NewMessage { message, .. } => assert_eq!(message.id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }
        match h.next_event().await {
            ChatEvent::UserJoined { user, .. } => assert_eq!(user.id, "rex"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_connection_reconnects_and_reannounces_rooms() {
        let mut h = Harness::start(vec![ConnectScript::Accept, ConnectScript::Accept]);
        h.handle.join_room(ROOM).await.expect("join");
        let mut first = h.connect().await;
        assert_eq!(first.next_frame().await["type"], "join_room");

        drop(first);
        assert_eq!(h.next_event().await, ChatEvent::Disconnected { reason: None });
        assert_eq!(
            h.next_event().await,
            ChatEvent::ReconnectScheduled {
                attempt: 1,
                delay_ms: 10
            }
        );
        assert_eq!(h.next_event().await, ChatEvent::Connecting { attempt: 1 });
        assert_eq!(h.next_event().await, ChatEvent::Connected);

        let mut second = h.next_peer().await;
        assert_eq!(
            second.next_frame().await,
            json!({"type": "join_room", "roomId": ROOM})
        );
    }

    #[tokio::test]
    async fn exhausted_reconnects_wait_for_manual_open() {
        let mut h = Harness::start(vec![
            ConnectScript::Fail,
            ConnectScript::Fail,
            ConnectScript::Fail,
            ConnectScript::Accept,
        ]);
        h.handle.open().await.expect("open");

        let mut expected_delay = 10;
        for attempt in 0..=2 {
            assert_eq!(h.next_event().await, ChatEvent::Connecting { attempt });
            match h.next_event().await {
                ChatEvent::ConnectionFailed { error } => {
                    assert_eq!(error.category, ChatErrorCategory::Connection)
                }
                other => panic!("unexpected event: {other:?}"),
            }
            if attempt < 2 {
                assert_eq!(
                    h.next_event().await,
                    ChatEvent::ReconnectScheduled {
                        attempt: attempt + 1,
                        delay_ms: expected_delay
                    }
                );
                expected_delay *= 2;
            }
        }
        assert_eq!(
            h.next_event().await,
            ChatEvent::ReconnectExhausted {
                attempts: 2,
                error: ChatError::reconnect_exhausted(2),
            }
        );
        h.expect_quiet(Duration::from_millis(100)).await;

        let _peer = h.connect().await;
    }

    #[tokio::test]
    async fn connect_timeout_is_a_connection_failure() {
        let config = ChatRuntimeConfig {
            reconnect_policy: ReconnectPolicy::new(10, 0),
            connect_timeout: Duration::from_millis(30),
            ..test_config()
        };
        let mut h = Harness::start_with(
            vec![ConnectScript::Hang],
            config,
            Arc::new(InMemoryKeyValueStore::default()),
        );
        h.handle.open().await.expect("open");

        assert_eq!(h.next_event().await, ChatEvent::Connecting { attempt: 0 });
        match h.next_event().await {
            ChatEvent::ConnectionFailed { error } => {
                assert_eq!(error.category, ChatErrorCategory::Timeout)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            h.next_event().await,
            ChatEvent::ReconnectExhausted {
                attempts: 0,
                error: ChatError::reconnect_exhausted(0),
            }
        );
    }

    #[tokio::test]
    async fn close_cancels_pending_reconnect() {
        let config = ChatRuntimeConfig {
            reconnect_policy: ReconnectPolicy::new(60, 3),
            ..test_config()
        };
        let mut h = Harness::start_with(
            vec![ConnectScript::Fail, ConnectScript::Accept],
            config,
            Arc::new(InMemoryKeyValueStore::default()),
        );
        h.handle.open().await.expect("open");
        assert_eq!(h.next_event().await, ChatEvent::Connecting { attempt: 0 });
        assert!(matches!(
            h.next_event().await,
            ChatEvent::ConnectionFailed { .. }
        ));
        assert!(matches!(
            h.next_event().await,
            ChatEvent::ReconnectScheduled { attempt: 1, .. }
        ));

        h.handle.close().await.expect("close");
        h.expect_quiet(Duration::from_millis(150)).await;

        let _peer = h.connect().await;
        h.handle.close().await.expect("close");
        assert_eq!(
            h.next_event().await,
            ChatEvent::Disconnected {
                reason: Some("closed by client".into())
            }
        );
        h.expect_quiet(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn ephemeral_frames_are_dropped_while_offline() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        h.send(ChatCommand::SendTyping {
            room_id: ROOM.into(),
            is_typing: true,
        })
        .await;

        let mut peer = h.connect().await;
        h.send(ChatCommand::SendReadReceipt {
            room_id: ROOM.into(),
            message_id: "s1".into(),
        })
        .await;

        assert_eq!(
            peer.next_frame().await,
            json!({"type": "read_receipt", "roomId": ROOM, "messageId": "s1"})
        );
    }

    #[tokio::test]
    async fn edits_are_limited_to_the_author() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        let peer = h.connect().await;
        peer.push(chat_frame("s1", "rex", "woof"));
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));

        h.send(ChatCommand::EditMessage {
            room_id: ROOM.into(),
            message_id: "s1".into(),
            new_text: "meow".into(),
        })
        .await;
        match h.next_event().await {
            ChatEvent::MutationRejected { error, .. } => {
                assert_eq!(error.category, ChatErrorCategory::Permission)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let own = h.handle.send_message(ROOM, "on my way", vec![]).await.expect("send");
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        h.send(ChatCommand::EditMessage {
            room_id: ROOM.into(),
            message_id: own.clone(),
            new_text: "running late".into(),
        })
        .await;
        match h.next_event().await {
            ChatEvent::MessageEdited { message, .. } => {
                assert_eq!(message.id, own);
                assert_eq!(message.text, "running late");
                assert!(message.edited);
                assert!(message.edit_timestamp.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.send(ChatCommand::EditMessage {
            room_id: ROOM.into(),
            message_id: "missing".into(),
            new_text: "x".into(),
        })
        .await;
        match h.next_event().await {
            ChatEvent::MutationRejected { error, .. } => {
                assert_eq!(error.category, ChatErrorCategory::NotFound)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deleting_a_queued_message_keeps_it_off_the_wire() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        let id = h.handle.send_message(ROOM, "oops", vec![]).await.expect("send");
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        assert!(matches!(h.next_event().await, ChatEvent::MessageQueued { .. }));

        h.send(ChatCommand::DeleteMessage {
            room_id: ROOM.into(),
            message_id: id.clone(),
        })
        .await;
        assert_eq!(
            h.next_event().await,
            ChatEvent::MessageDeleted {
                room_id: ROOM.into(),
                message_id: id
            }
        );

        let mut peer = h.connect().await;
        h.send(ChatCommand::SendTyping {
            room_id: ROOM.into(),
            is_typing: false,
        })
        .await;
        assert_eq!(peer.next_frame().await["type"], "typing");
    }

    #[tokio::test]
    async fn sync_merges_batches_and_reports_failures() {
        let mut h = Harness::start(vec![]);
        h.handle.join_room(ROOM).await.expect("join");
        h.sync.push(Ok(SyncResponse {
            messages: vec![SyncRoomBatch {
                room_id: ROOM.into(),
                messages: vec![server_message("s1", "rex", "synced")],
            }],
            server_time: Some(1_717_317_000_000),
        }));
        h.sync.push(Err(ChatError::new(
            ChatErrorCategory::Connection,
            "sync_unreachable",
            "offline",
        )));

        h.handle.sync_now().await.expect("sync");
        match h.next_event().await {
            ChatEvent::NewMessage { room_id, message } => {
                assert_eq!(room_id, ROOM);
                assert_eq!(message.id, "s1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            h.next_event().await,
            ChatEvent::SyncCompleted {
                merged: 1,
                cursor: SyncCursor::from_millis(1_717_317_000_000)
            }
        );

        h.handle.sync_now().await.expect("sync");
        match h.next_event().await {
            ChatEvent::SyncFailed { error } => assert_eq!(error.code, "sync_unreachable"),
            other => panic!("unexpected event: {other:?}"),
        }

        let requests = h.sync.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].last_sync, SyncCursor::ZERO);
        assert_eq!(requests[0].rooms, vec![ROOM]);
        assert_eq!(
            requests[1].last_sync,
            SyncCursor::from_millis(1_717_317_000_000)
        );
    }

    #[tokio::test]
    async fn rejected_sync_batch_keeps_the_cursor() {
        let mut h = Harness::start(vec![]);
        let mut foreign = server_message("s2", "rex", "wrong room");
        foreign.room_id = Some("vet".into());
        h.sync.push(Ok(SyncResponse {
            messages: vec![SyncRoomBatch {
                room_id: ROOM.into(),
                messages: vec![server_message("s1", "rex", "ok"), foreign],
            }],
            server_time: Some(5_000),
        }));

        h.handle.sync_now().await.expect("sync");
        match h.next_event().await {
            ChatEvent::SyncFailed { error } => assert_eq!(error.code, "sync_batch_rejected"),
            other => panic!("unexpected event: {other:?}"),
        }

        h.handle.sync_now().await.expect("sync");
        assert_eq!(
            h.next_event().await,
            ChatEvent::SyncCompleted {
                merged: 0,
                cursor: SyncCursor::ZERO
            }
        );
        assert_eq!(h.sync.requests()[1].last_sync, SyncCursor::ZERO);
    }

    #[tokio::test]
    async fn periodic_sync_runs_only_in_foreground() {
        let config = ChatRuntimeConfig {
            sync_interval: Duration::from_millis(40),
            ..test_config()
        };
        let mut h = Harness::start_with(
            vec![],
            config,
            Arc::new(InMemoryKeyValueStore::default()),
        );
        h.expect_quiet(Duration::from_millis(120)).await;
        assert!(h.sync.requests().is_empty());

        h.handle.set_foreground(true).await.expect("foreground");
        assert!(matches!(
            h.next_event().await,
            ChatEvent::SyncCompleted { .. }
        ));

        h.handle.set_foreground(false).await.expect("background");
        // Drain a tick that may already be in flight.
        let _ = timeout(Duration::from_millis(80), h.events.recv()).await;
        let seen = h.sync.requests().len();
        h.expect_quiet(Duration::from_millis(120)).await;
        assert_eq!(h.sync.requests().len(), seen);
    }

    #[tokio::test]
    async fn restarted_runtime_restores_the_log() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::default());
        let mut first = Harness::start_with(vec![], test_config(), Arc::clone(&storage));
        let id = first
            .handle
            .send_message(ROOM, "Meet at the Oak Gate", vec![])
            .await
            .expect("send");
        assert!(matches!(first.next_event().await, ChatEvent::NewMessage { .. }));
        assert!(matches!(first.next_event().await, ChatEvent::MessageQueued { .. }));
        drop(first);

        let mut second = Harness::start_with(vec![], test_config(), Arc::clone(&storage));
        second
            .send(ChatCommand::SearchMessages {
                room_id: ROOM.into(),
                query: "oak gate".into(),
                limit: None,
            })
            .await;
        match second.next_event().await {
            ChatEvent::SearchResults { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].id, id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_session_drops_log_and_queue() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        h.handle.send_message(ROOM, "pending", vec![]).await.expect("send");
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        assert!(matches!(h.next_event().await, ChatEvent::MessageQueued { .. }));

        h.send(ChatCommand::ClearSession).await;
        assert_eq!(h.next_event().await, ChatEvent::SessionCleared);
        assert!(
            h.storage
                .get_value(DEFAULT_STORAGE_NAMESPACE, chat_core::MESSAGES_KEY)
                .is_err()
        );

        let mut peer = h.connect().await;
        h.send(ChatCommand::SearchMessages {
            room_id: ROOM.into(),
            query: "pending".into(),
            limit: Some(5),
        })
        .await;
        match h.next_event().await {
            ChatEvent::SearchResults { messages, .. } => assert!(messages.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
        h.send(ChatCommand::SendTyping {
            room_id: ROOM.into(),
            is_typing: true,
        })
        .await;
        assert_eq!(peer.next_frame().await["type"], "typing");
    }

    #[tokio::test]
    async fn rejects_invalid_sends() {
        let mut h = Harness::start(vec![]);
        h.send(ChatCommand::SendMessage {
            room_id: ROOM.into(),
            message_id: "m1".into(),
            text: "x".repeat(chat_core::MAX_MESSAGE_CHARS + 1),
            attachments: vec![],
        })
        .await;
        match h.next_event().await {
            ChatEvent::CommandFailed { error } => {
                assert_eq!(error.category, ChatErrorCategory::Validation)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        for _ in 0..2 {
            h.send(ChatCommand::SendMessage {
                room_id: ROOM.into(),
                message_id: "m1".into(),
                text: "hi".into(),
                attachments: vec![],
            })
            .await;
        }
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        assert!(matches!(h.next_event().await, ChatEvent::MessageQueued { .. }));
        match h.next_event().await {
            ChatEvent::CommandFailed { error } => assert_eq!(error.code, "duplicate_message_id"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_while_connected_is_rejected() {
        let mut h = Harness::start(vec![ConnectScript::Accept]);
        let _peer = h.connect().await;
        h.handle.open().await.expect("open");
        match h.next_event().await {
            ChatEvent::CommandFailed { error } => {
                assert_eq!(error.code, "invalid_state_transition")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupted_drain_resends_the_rest_in_order_after_reconnect() {
        let mut h = Harness::start(vec![
            ConnectScript::AcceptFailingAfter(1),
            ConnectScript::Accept,
        ]);
        let mut ids = Vec::new();
        for text in ["leash", "ball", "treats"] {
            ids.push(h.handle.send_message(ROOM, text, vec![]).await.expect("send"));
            assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
            assert!(matches!(h.next_event().await, ChatEvent::MessageQueued { .. }));
        }

        let mut first = h.connect().await;
        assert_eq!(
            h.next_event().await,
            ChatEvent::Disconnected {
                reason: Some(WRITE_FAILED.into())
            }
        );
        assert_eq!(
            h.next_event().await,
            ChatEvent::QueueDrained {
                sent: 1,
                remaining: 2
            }
        );
        assert_eq!(
            h.next_event().await,
            ChatEvent::ReconnectScheduled {
                attempt: 1,
                delay_ms: 10
            }
        );
        assert_eq!(h.next_event().await, ChatEvent::Connecting { attempt: 1 });
        assert_eq!(h.next_event().await, ChatEvent::Connected);
        assert_eq!(
            h.next_event().await,
            ChatEvent::QueueDrained {
                sent: 2,
                remaining: 0
            }
        );

        assert_eq!(first.next_frame().await["message"]["id"], ids[0].as_str());
        let mut second = h.next_peer().await;
        for id in &ids[1..] {
            assert_eq!(second.next_frame().await["message"]["id"], id.as_str());
        }
    }

    #[tokio::test]
    async fn failed_write_returns_a_direct_send_to_the_queue() {
        let mut h = Harness::start(vec![
            ConnectScript::AcceptFailingAfter(0),
            ConnectScript::Accept,
        ]);
        let _first = h.connect().await;

        let id = h.handle.send_message(ROOM, "heel", vec![]).await.expect("send");
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        assert_eq!(
            h.next_event().await,
            ChatEvent::Disconnected {
                reason: Some(WRITE_FAILED.into())
            }
        );
        assert_eq!(
            h.next_event().await,
            ChatEvent::MessageQueued {
                room_id: ROOM.into(),
                message_id: id.clone(),
                queue_len: 1
            }
        );
        assert!(matches!(
            h.next_event().await,
            ChatEvent::ReconnectScheduled { attempt: 1, .. }
        ));
        assert_eq!(h.next_event().await, ChatEvent::Connecting { attempt: 1 });
        assert_eq!(h.next_event().await, ChatEvent::Connected);
        assert_eq!(
            h.next_event().await,
            ChatEvent::QueueDrained {
                sent: 1,
                remaining: 0
            }
        );

        let mut second = h.next_peer().await;
        assert_eq!(second.next_frame().await["message"]["id"], id.as_str());
    }

    #[tokio::test]
    async fn close_keeps_unconfirmed_sends_for_the_next_open() {
        let mut h = Harness::start(vec![ConnectScript::AcceptUnconfirmed, ConnectScript::Accept]);
        let mut first = h.connect().await;

        let id = h.handle.send_message(ROOM, "sit", vec![]).await.expect("send");
        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        assert_eq!(first.next_frame().await["message"]["id"], id.as_str());

        h.handle.close().await.expect("close");
        assert_eq!(
            h.next_event().await,
            ChatEvent::Disconnected {
                reason: Some("closed by client".into())
            }
        );
        assert_eq!(
            h.next_event().await,
            ChatEvent::MessageQueued {
                room_id: ROOM.into(),
                message_id: id.clone(),
                queue_len: 1
            }
        );

        let mut second = h.connect().await;
        assert_eq!(
            h.next_event().await,
            ChatEvent::QueueDrained {
                sent: 1,
                remaining: 0
            }
        );
        // Delivered twice; receivers drop the repeat by id.
        assert_eq!(second.next_frame().await["message"]["id"], id.as_str());
    }

    #[tokio::test]
    async fn history_commands_answer_from_the_local_log() {
        let mut h = Harness::start(vec![]);
        for text in ["walk 0", "walk 1", "walk 2"] {
            h.handle.send_message(ROOM, text, vec![]).await.expect("send");
            assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
            assert!(matches!(h.next_event().await, ChatEvent::MessageQueued { .. }));
        }

        h.handle
            .load_recent_messages(ROOM, Some(2))
            .await
            .expect("recent");
        match h.next_event().await {
            ChatEvent::RoomHistory { room_id, messages } => {
                assert_eq!(room_id, ROOM);
                let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, ["walk 1", "walk 2"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.handle.load_messages(ROOM).await.expect("all");
        match h.next_event().await {
            ChatEvent::RoomHistory { messages, .. } => {
                assert_eq!(messages.len(), 3);
                assert_eq!(messages[0].text, "walk 0");
                assert_eq!(messages[0].room_id.as_deref(), Some(ROOM));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.handle.load_recent_messages("vet", None).await.expect("recent");
        assert_eq!(
            h.next_event().await,
            ChatEvent::RoomHistory {
                room_id: "vet".into(),
                messages: vec![]
            }
        );
    }

    #[tokio::test]
    async fn room_directory_commands_report_results_and_failures() {
        let mut h = Harness::start(vec![]);

        h.handle.list_rooms().await.expect("list");
        assert_eq!(
            h.next_event().await,
            ChatEvent::RoomsListed {
                rooms: vec![room_info(ROOM, "Park walk")]
            }
        );

        h.handle
            .create_room(NewRoom::named("Dog Beach"))
            .await
            .expect("create");
        let created = match h.next_event().await {
            ChatEvent::RoomCreated { room } => room,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(created.id, "dog-beach");

        h.handle.room_info("dog-beach").await.expect("info");
        assert_eq!(
            h.next_event().await,
            ChatEvent::RoomInfoLoaded { room: created }
        );

        h.handle.room_info("vet").await.expect("info");
        match h.next_event().await {
            ChatEvent::CommandFailed { error } => {
                assert_eq!(error.category, ChatErrorCategory::NotFound);
                assert_eq!(error.code, "rooms_not_found");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.handle
            .create_room(NewRoom::named("   "))
            .await
            .expect("create");
        match h.next_event().await {
            ChatEvent::CommandFailed { error } => assert_eq!(error.code, "missing_room_name"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn storage_write_failures_are_reported() {
        let mut h = Harness::start_with(vec![], test_config(), Arc::new(ReadOnlyStore));
        h.handle.send_message(ROOM, "fetch", vec![]).await.expect("send");

        assert!(matches!(h.next_event().await, ChatEvent::NewMessage { .. }));
        assert!(matches!(h.next_event().await, ChatEvent::MessageQueued { .. }));
        match h.next_event().await {
            ChatEvent::PersistenceFailed { error } => {
                assert_eq!(error.category, ChatErrorCategory::Storage)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        h.expect_quiet(Duration::from_millis(50)).await;
    }
}
