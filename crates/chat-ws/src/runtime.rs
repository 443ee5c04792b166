use std::{sync::Arc, time::Duration};

use chat_core::{
    ChatCommand, ChatError, ChatErrorCategory, ChatEvent, ConnectionState,
    ConnectionStateMachine, DEFAULT_RECENT_LIMIT, InboundDecode, InboundFrame, MAX_MESSAGE_CHARS,
    Message, MessageStoreError, NewRoom, OutboundFrame, OutboundQueue, ReconnectDecision,
    ReconnectTracker, SyncOutcome, SyncResponse, SyncTicket, decode_inbound, encode_outbound,
    inbound_event, normalization::command_failed,
};
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ChatRuntimeConfig, RuntimeDeps,
    identity::IdentityProvider,
    rooms_client::RoomsClient,
    session::Session,
    sync_client::SyncClient,
    transport::{Connector, TransportConnection, TransportError, TransportIncoming},
};

const CLIENT_CLOSE_REASON: &str = "closed by client";
const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Results of work the actor spawned off its own task.
enum RuntimeSignal {
    ConnectFinished {
        generation: u64,
        result: Result<TransportConnection, TransportError>,
    },
    ReconnectDue {
        generation: u64,
    },
    SyncFinished {
        ticket: SyncTicket,
        result: Result<SyncResponse, ChatError>,
    },
    RoomRequestFinished {
        result: Result<ChatEvent, ChatError>,
    },
}

enum RoomRequest {
    List,
    Create(NewRoom),
    Info(String),
}

/// A drain pass whose frames are still waiting for write receipts.
struct DrainProgress {
    last_receipt: u64,
    sent: usize,
}

pub(crate) struct ChatRuntime {
    config: ChatRuntimeConfig,
    events: broadcast::Sender<ChatEvent>,
    command_rx: mpsc::Receiver<ChatCommand>,
    signal_tx: mpsc::UnboundedSender<RuntimeSignal>,
    signal_rx: mpsc::UnboundedReceiver<RuntimeSignal>,
    connector: Arc<dyn Connector>,
    sync_client: Arc<dyn SyncClient>,
    rooms_client: Arc<dyn RoomsClient>,
    identity: Arc<dyn IdentityProvider>,
    session: Session,
    queue: OutboundQueue,
    drain: Option<DrainProgress>,
    state: ConnectionStateMachine,
    reconnect: ReconnectTracker,
    connection: Option<TransportConnection>,
    // Bumped on every connect attempt and on close; stale connect results
    // and reconnect timers carry an older value and are dropped.
    generation: u64,
    reconnect_timer: Option<CancellationToken>,
    sync_tick: Interval,
    foreground: bool,
}

impl ChatRuntime {
    pub(crate) fn new(
        config: ChatRuntimeConfig,
        events: broadcast::Sender<ChatEvent>,
        command_rx: mpsc::Receiver<ChatCommand>,
        deps: RuntimeDeps,
        session: Session,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let period = config.sync_interval.max(MIN_SYNC_INTERVAL);
        let mut sync_tick = time::interval_at(Instant::now() + period, period);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            reconnect: ReconnectTracker::new(config.reconnect_policy),
            foreground: config.start_foreground,
            config,
            events,
            command_rx,
            signal_tx,
            signal_rx,
            connector: deps.connector,
            sync_client: deps.sync_client,
            rooms_client: deps.rooms_client,
            identity: deps.identity,
            session,
            queue: OutboundQueue::new(),
            drain: None,
            state: ConnectionStateMachine::default(),
            connection: None,
            generation: 0,
            reconnect_timer: None,
            sync_tick,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = self.signal_rx.recv() => self.handle_signal(signal),
                incoming = next_incoming(&mut self.connection) => self.handle_incoming(incoming),
                _ = self.sync_tick.tick(), if self.foreground => self.start_sync(),
            }
            self.report_persistence_failure();
        }

        self.cancel_reconnect_timer();
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        info!("chat runtime stopped");
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Open => self.handle_open(),
            ChatCommand::Close => self.handle_close(),
            ChatCommand::SendMessage {
                room_id,
                message_id,
                text,
                attachments,
            } => self.handle_send_message(room_id, message_id, text, attachments),
            ChatCommand::SendTyping { room_id, is_typing } => {
                self.send_ephemeral(OutboundFrame::Typing { room_id, is_typing })
            }
            ChatCommand::SendReadReceipt {
                room_id,
                message_id,
            } => self.send_ephemeral(OutboundFrame::ReadReceipt {
                room_id,
                message_id,
            }),
            ChatCommand::JoinRoom { room_id } => self.handle_join_room(room_id),
            ChatCommand::LeaveRoom { room_id } => self.handle_leave_room(room_id),
            ChatCommand::EditMessage {
                room_id,
                message_id,
                new_text,
            } => self.handle_edit_message(room_id, message_id, new_text),
            ChatCommand::DeleteMessage {
                room_id,
                message_id,
            } => self.handle_delete_message(room_id, message_id),
            ChatCommand::SearchMessages {
                room_id,
                query,
                limit,
            } => self.handle_search(room_id, query, limit),
            ChatCommand::LoadMessages { room_id } => self.handle_load_history(room_id, None),
            ChatCommand::LoadRecentMessages { room_id, limit } => {
                self.handle_load_history(room_id, Some(limit.unwrap_or(DEFAULT_RECENT_LIMIT)))
            }
            ChatCommand::ListRooms => self.start_room_request(RoomRequest::List),
            ChatCommand::CreateRoom { room } => {
                if room.name.trim().is_empty() {
                    self.emit(command_failed(ChatError::new(
                        ChatErrorCategory::Validation,
                        "missing_room_name",
                        "room name must not be empty",
                    )));
                } else {
                    self.start_room_request(RoomRequest::Create(room));
                }
            }
            ChatCommand::FetchRoomInfo { room_id } => {
                self.start_room_request(RoomRequest::Info(room_id))
            }
            ChatCommand::SyncNow => self.start_sync(),
            ChatCommand::SetForeground { foreground } => self.handle_set_foreground(foreground),
            ChatCommand::ClearSession => self.handle_clear_session(),
        }
    }

    fn handle_signal(&mut self, signal: RuntimeSignal) {
        match signal {
            RuntimeSignal::ConnectFinished { generation, result } => {
                self.finish_connect(generation, result)
            }
            RuntimeSignal::ReconnectDue { generation } => self.handle_reconnect_due(generation),
            RuntimeSignal::SyncFinished { ticket, result } => self.finish_sync(ticket, result),
            RuntimeSignal::RoomRequestFinished { result } => match result {
                Ok(event) => self.emit(event),
                Err(error) => {
                    warn!(error = %error, "room directory request failed");
                    self.emit(command_failed(error));
                }
            },
        }
    }

    fn handle_open(&mut self) {
        if self.state.state() != ConnectionState::Disconnected {
            self.emit(command_failed(ChatError::invalid_state(
                self.state.state(),
                "open",
            )));
            return;
        }
        self.cancel_reconnect_timer();
        self.reconnect.reset();
        self.start_connect(0);
    }

    fn handle_close(&mut self) {
        self.cancel_reconnect_timer();
        self.generation = self.generation.wrapping_add(1);
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        if let Some(event) = self.state.close(CLIENT_CLOSE_REASON) {
            info!("chat transport closed by client");
            self.emit(event);
        }
        // The writer may still flush these; resending on the next open keeps
        // delivery at-least-once.
        self.reclaim_in_flight();
    }

    fn start_connect(&mut self, attempt: u32) {
        match self.state.begin_connect(attempt) {
            Ok(event) => self.emit(event),
            Err(err) => {
                self.emit(command_failed(err));
                return;
            }
        }

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let signals = self.signal_tx.clone();
        let connect_timeout = self.config.connect_timeout;
        debug!(attempt, generation, "connecting");

        tokio::spawn(async move {
            let result = match time::timeout(connect_timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(connect_timeout)),
            };
            let _ = signals.send(RuntimeSignal::ConnectFinished { generation, result });
        });
    }

    fn finish_connect(
        &mut self,
        generation: u64,
        result: Result<TransportConnection, TransportError>,
    ) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping stale connect result");
            return;
        }

        match result {
            Ok(connection) => {
                let event = match self.state.on_connected() {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "connect finished outside of connecting state");
                        return;
                    }
                };
                info!("chat transport connected");
                self.connection = Some(connection);
                self.reconnect.on_connected();
                self.emit(event);
                self.announce_joined_rooms();
                self.flush_queue();
            }
            Err(err) => {
                let error = ChatError::from(&err);
                warn!(error = %err, "chat transport connect failed");
                match self.state.on_connect_failed(error) {
                    Ok(event) => self.emit(event),
                    Err(err) => {
                        warn!(error = %err, "connect failure outside of connecting state");
                        return;
                    }
                }
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.on_disconnected() {
            ReconnectDecision::Retry { attempt, delay } => {
                self.cancel_reconnect_timer();
                let token = CancellationToken::new();
                let cancelled = token.child_token();
                let signals = self.signal_tx.clone();
                let generation = self.generation;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancelled.cancelled() => {}
                        _ = time::sleep(delay) => {
                            let _ = signals.send(RuntimeSignal::ReconnectDue { generation });
                        }
                    }
                });

                self.reconnect_timer = Some(token);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(attempt, delay_ms, "reconnect scheduled");
                self.emit(ChatEvent::ReconnectScheduled { attempt, delay_ms });
            }
            ReconnectDecision::Exhausted { attempts } => {
                warn!(attempts, "reconnect attempts exhausted");
                self.emit(ChatEvent::ReconnectExhausted {
                    attempts,
                    error: ChatError::reconnect_exhausted(attempts),
                });
            }
        }
    }

    fn handle_reconnect_due(&mut self, generation: u64) {
        if generation != self.generation || self.state.state() != ConnectionState::Disconnected {
            debug!(generation, "ignoring stale reconnect timer");
            return;
        }
        self.reconnect_timer = None;
        self.start_connect(self.reconnect.attempt());
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(token) = self.reconnect_timer.take() {
            token.cancel();
        }
    }

    fn handle_incoming(&mut self, incoming: TransportIncoming) {
        match incoming {
            TransportIncoming::Text(raw) => match decode_inbound(&raw) {
                InboundDecode::Frame(frame) => self.handle_frame(frame),
                InboundDecode::Unrecognized { kind } => {
                    debug!(kind, "ignoring unrecognized inbound frame");
                }
                InboundDecode::Malformed { reason } => {
                    warn!(reason, "ignoring malformed inbound frame");
                }
            },
            TransportIncoming::Written { receipt } => self.handle_written(receipt),
            TransportIncoming::Closed { reason } => {
                self.connection = None;
                let closed = self.state.on_transport_closed(reason);
                match &closed {
                    Ok(event) => {
                        warn!(?event, "chat transport dropped");
                        self.emit(event.clone());
                    }
                    Err(err) => debug!(error = %err, "transport closed outside of connected state"),
                }
                self.reclaim_in_flight();
                if closed.is_ok() {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn handle_written(&mut self, receipt: u64) {
        let written = self.queue.acknowledge(receipt);
        let Some(progress) = self.drain.as_mut() else {
            return;
        };
        let last_receipt = progress.last_receipt;
        progress.sent += written
            .iter()
            .filter(|flight| flight.receipt <= last_receipt)
            .count();
        if receipt >= last_receipt {
            self.finish_drain();
        }
    }

    fn finish_drain(&mut self) {
        let Some(progress) = self.drain.take() else {
            return;
        };
        let remaining = self.queue.len();
        if remaining == 0 {
            info!(sent = progress.sent, "outbound queue drained");
        } else {
            warn!(sent = progress.sent, remaining, "outbound queue drain interrupted");
        }
        self.emit(ChatEvent::QueueDrained {
            sent: progress.sent,
            remaining,
        });
    }

    /// Return unconfirmed chat messages to the front of the queue.
    fn reclaim_in_flight(&mut self) {
        let returned = self.queue.requeue_in_flight();
        let drained_up_to = self.drain.as_ref().map(|progress| progress.last_receipt);
        self.finish_drain();
        if returned.is_empty() {
            return;
        }

        info!(count = returned.len(), "returned unconfirmed messages to the queue");
        let queue_len = self.queue.len();
        for flight in returned {
            // Drained entries were announced as queued when first composed.
            if drained_up_to.is_some_and(|last| flight.receipt <= last) {
                continue;
            }
            self.emit(ChatEvent::MessageQueued {
                room_id: flight.entry.room_id,
                message_id: flight.entry.message.id,
                queue_len,
            });
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::ChatMessage { room_id, message } => {
                if message.id.is_empty() || !Message::text_within_bounds(&message.text) {
                    warn!(room_id, "ignoring invalid inbound chat message");
                    return;
                }
                let message = message.in_room(room_id.clone());
                if self.session.append(&room_id, message.clone()) {
                    self.emit(ChatEvent::NewMessage { room_id, message });
                } else {
                    debug!(room_id, message_id = message.id, "ignoring duplicate message");
                }
            }
            other => self.emit(inbound_event(other)),
        }
    }

    fn send_frame(&self, frame: &OutboundFrame) -> Result<(), ChatError> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(ChatError::from(&TransportError::NotConnected));
        };
        let text = encode_outbound(frame)?;
        connection
            .send_text(text)
            .map_err(|err| ChatError::from(&err))
    }

    fn send_chat(&mut self, frame: &OutboundFrame) -> Result<u64, ChatError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(ChatError::from(&TransportError::NotConnected));
        };
        let text = encode_outbound(frame)?;
        connection
            .send_tracked(text)
            .map_err(|err| ChatError::from(&err))
    }

    fn announce_joined_rooms(&self) {
        for room_id in self.session.store().joined_rooms() {
            if let Err(err) = self.send_frame(&OutboundFrame::JoinRoom {
                room_id: room_id.clone(),
            }) {
                warn!(room_id, error = %err, "failed re-announcing room");
            }
        }
    }

    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let report = self.queue.drain(|entry| {
            let text = encode_outbound(&entry.to_frame())?;
            connection
                .send_tracked(text)
                .map_err(|err| ChatError::from(&err))
        });

        if let Some(err) = &report.error {
            warn!(
                dispatched = report.dispatched,
                remaining = report.remaining,
                error = %err,
                "outbound queue drain stopped"
            );
        }
        match report.last_receipt {
            // Reported once the writer confirms the last frame or the
            // connection drops.
            Some(last_receipt) => {
                debug!(dispatched = report.dispatched, "queued messages handed to the writer");
                self.drain = Some(DrainProgress {
                    last_receipt,
                    sent: 0,
                });
            }
            None => self.emit(ChatEvent::QueueDrained {
                sent: 0,
                remaining: report.remaining,
            }),
        }
    }

    fn handle_send_message(
        &mut self,
        room_id: String,
        message_id: String,
        text: String,
        attachments: Vec<String>,
    ) {
        let Some(sender) = self.identity.current_user() else {
            self.emit(command_failed(no_identity()));
            return;
        };
        if message_id.is_empty() {
            self.emit(command_failed(ChatError::new(
                ChatErrorCategory::Validation,
                "missing_message_id",
                "message id must not be empty",
            )));
            return;
        }
        if !Message::text_within_bounds(&text) {
            self.emit(command_failed(ChatError::from(
                &MessageStoreError::TextTooLong {
                    len: text.chars().count(),
                    max: MAX_MESSAGE_CHARS,
                },
            )));
            return;
        }

        let message = Message::new(message_id, sender, text, Utc::now()).with_attachments(attachments);
        if !self.session.append(&room_id, message.clone()) {
            self.emit(command_failed(ChatError::new(
                ChatErrorCategory::Validation,
                "duplicate_message_id",
                format!("message '{}' already exists in room '{room_id}'", message.id),
            )));
            return;
        }
        self.emit(ChatEvent::NewMessage {
            room_id: room_id.clone(),
            message: message.clone().in_room(room_id.clone()),
        });

        let frame = OutboundFrame::ChatMessage {
            room_id: room_id.clone(),
            message: message.clone(),
        };
        if self.state.is_connected() {
            match self.send_chat(&frame) {
                Ok(receipt) => {
                    self.queue.track(room_id, message, receipt);
                    return;
                }
                Err(err) => warn!(room_id, error = %err, "send failed, queueing message"),
            }
        }

        let message_id = message.id.clone();
        let queue_len = self.queue.enqueue(room_id.clone(), message);
        debug!(room_id, message_id, queue_len, "message queued");
        self.emit(ChatEvent::MessageQueued {
            room_id,
            message_id,
            queue_len,
        });
    }

    fn send_ephemeral(&self, frame: OutboundFrame) {
        if !self.state.is_connected() {
            debug!(room_id = frame.room_id(), "dropping ephemeral frame while disconnected");
            return;
        }
        if let Err(err) = self.send_frame(&frame) {
            debug!(room_id = frame.room_id(), error = %err, "ephemeral frame not sent");
        }
    }

    fn handle_join_room(&mut self, room_id: String) {
        self.session.set_joined(&room_id, true);
        if self.state.is_connected()
            && let Err(err) = self.send_frame(&OutboundFrame::JoinRoom {
                room_id: room_id.clone(),
            })
        {
            warn!(room_id, error = %err, "join frame not sent");
        }
    }

    fn handle_leave_room(&mut self, room_id: String) {
        self.session.set_joined(&room_id, false);
        if self.state.is_connected()
            && let Err(err) = self.send_frame(&OutboundFrame::LeaveRoom {
                room_id: room_id.clone(),
            })
        {
            warn!(room_id, error = %err, "leave frame not sent");
        }
    }

    fn handle_edit_message(&mut self, room_id: String, message_id: String, new_text: String) {
        let Some(editor) = self.identity.current_user() else {
            self.emit(ChatEvent::MutationRejected {
                room_id,
                message_id,
                error: no_identity(),
            });
            return;
        };

        match self
            .session
            .edit(&room_id, &message_id, &new_text, &editor.id, Utc::now())
        {
            Ok(message) => self.emit(ChatEvent::MessageEdited { room_id, message }),
            Err(err) => {
                debug!(room_id, message_id, error = %err, "edit rejected");
                self.emit(ChatEvent::MutationRejected {
                    room_id,
                    message_id,
                    error: ChatError::from(&err),
                });
            }
        }
    }

    fn handle_delete_message(&mut self, room_id: String, message_id: String) {
        let cancelled = self.queue.cancel(&room_id, &message_id);
        if self.session.delete(&room_id, &message_id) || cancelled {
            self.emit(ChatEvent::MessageDeleted {
                room_id,
                message_id,
            });
            return;
        }

        let err = MessageStoreError::NotFound {
            room_id: room_id.clone(),
            message_id: message_id.clone(),
        };
        self.emit(ChatEvent::MutationRejected {
            room_id,
            message_id,
            error: ChatError::from(&err),
        });
    }

    fn handle_search(&self, room_id: String, query: String, limit: Option<usize>) {
        let messages = self
            .session
            .store()
            .search(&room_id, &query)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        self.emit(ChatEvent::SearchResults {
            room_id,
            query,
            messages,
        });
    }

    fn handle_load_history(&self, room_id: String, limit: Option<usize>) {
        let store = self.session.store();
        let messages = match limit {
            Some(limit) => store.recent_messages(&room_id, limit),
            None => store.messages(&room_id),
        }
        .to_vec();
        self.emit(ChatEvent::RoomHistory { room_id, messages });
    }

    fn start_room_request(&self, request: RoomRequest) {
        let client = Arc::clone(&self.rooms_client);
        let signals = self.signal_tx.clone();
        let request_timeout = self.config.request_timeout;

        tokio::spawn(async move {
            let work = async {
                match request {
                    RoomRequest::List => client
                        .list_rooms()
                        .await
                        .map(|rooms| ChatEvent::RoomsListed { rooms }),
                    RoomRequest::Create(room) => client
                        .create_room(&room)
                        .await
                        .map(|room| ChatEvent::RoomCreated { room }),
                    RoomRequest::Info(room_id) => client
                        .room_info(&room_id)
                        .await
                        .map(|room| ChatEvent::RoomInfoLoaded { room }),
                }
            };
            let result = match time::timeout(request_timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::new(
                    ChatErrorCategory::Timeout,
                    "rooms_timeout",
                    format!("room request did not finish within {request_timeout:?}"),
                )),
            };
            let _ = signals.send(RuntimeSignal::RoomRequestFinished { result });
        });
    }

    fn handle_set_foreground(&mut self, foreground: bool) {
        if self.foreground == foreground {
            return;
        }
        self.foreground = foreground;
        if foreground {
            // The interval restarts; the first tick comes one full period later.
            self.sync_tick.reset();
        }
        info!(foreground, "periodic sync toggled");
    }

    fn handle_clear_session(&mut self) {
        self.session.clear();
        self.queue.clear();
        self.drain = None;
        info!("chat session cleared");
        self.emit(ChatEvent::SessionCleared);
    }

    fn start_sync(&mut self) {
        let (ticket, request) = self.session.begin_sync();
        let client = Arc::clone(&self.sync_client);
        let signals = self.signal_tx.clone();
        let sync_timeout = self.config.sync_timeout;
        debug!(
            rooms = request.rooms.len(),
            last_sync = request.last_sync.as_millis(),
            "starting sync"
        );

        tokio::spawn(async move {
            let result = match time::timeout(sync_timeout, client.fetch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::new(
                    ChatErrorCategory::Timeout,
                    "sync_timeout",
                    format!("sync did not finish within {sync_timeout:?}"),
                )),
            };
            let _ = signals.send(RuntimeSignal::SyncFinished { ticket, result });
        });
    }

    fn finish_sync(&mut self, ticket: SyncTicket, result: Result<SyncResponse, ChatError>) {
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "sync failed");
                self.emit(ChatEvent::SyncFailed { error });
                return;
            }
        };

        match self.session.apply_sync(ticket, &response) {
            Ok(SyncOutcome::Applied { merged, cursor }) => {
                let count = merged.len();
                for message in merged {
                    if let Some(room_id) = message.room_id.clone() {
                        self.emit(ChatEvent::NewMessage { room_id, message });
                    }
                }
                info!(merged = count, cursor = cursor.as_millis(), "sync completed");
                self.emit(ChatEvent::SyncCompleted {
                    merged: count,
                    cursor,
                });
            }
            Ok(SyncOutcome::Stale) => {
                debug!(issued_at = ticket.issued_at().as_millis(), "dropping stale sync result");
            }
            Err(err) => {
                warn!(error = %err, "sync batch rejected");
                self.emit(ChatEvent::SyncFailed {
                    error: ChatError::from(&err),
                });
            }
        }
    }

    fn report_persistence_failure(&mut self) {
        if let Some(error) = self.session.take_persistence_error() {
            self.emit(ChatEvent::PersistenceFailed { error });
        }
    }
}

async fn next_incoming(connection: &mut Option<TransportConnection>) -> TransportIncoming {
    match connection {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

fn no_identity() -> ChatError {
    ChatError::new(
        ChatErrorCategory::Auth,
        "no_identity",
        "no signed-in user is available",
    )
}
