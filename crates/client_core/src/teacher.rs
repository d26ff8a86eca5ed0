use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryStatus, MessageId, Role, RosterEntry, SocketId},
    protocol::{ClientRequest, SentMessageRecord, ServerEvent},
};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    cache::{Direction, HistoryMode, IncomingMessage, MessageCache},
    durable::{MessageLog, StateStore, StoredIdentity},
    error::ClientError,
    permission::PermissionGate,
    recipients::{self, Selection},
    roster::Roster,
    session::{ConnectionState, SessionManager, TeacherIdentity},
    transport::{Transport, TransportConnector, TransportEvent},
    CachedMessage, ClientEvent, NoticeLevel, SENT_LOG_CAP,
};

/// One entry of the teacher's outbound history. Labeled from the display
/// names captured at send time; the ack itself only carries status and id.
#[derive(Debug, Clone, PartialEq)]
pub struct SentEntry {
    pub id: MessageId,
    pub label: String,
    pub recipients: Vec<String>,
    pub is_all: bool,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl SentEntry {
    fn from_record(record: SentMessageRecord) -> Self {
        let is_all = record.recipient == "all";
        let recipients: Vec<String> = if is_all {
            Vec::new()
        } else {
            record
                .recipient
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        };
        Self {
            label: if is_all {
                "전체 학생".to_string()
            } else {
                record.recipient.clone()
            },
            id: record.id,
            recipients,
            is_all,
            body: record.message,
            timestamp: record.timestamp,
        }
    }
}

struct PendingJoin {
    generation: u64,
    respond: oneshot::Sender<Vec<RosterEntry>>,
}

struct PendingSend {
    display_names: Vec<String>,
    is_all: bool,
    body: String,
}

struct TeacherState {
    session: SessionManager<TeacherIdentity>,
    roster: Roster,
    permission: PermissionGate,
    inbox: MessageCache,
    sent_log: Vec<SentEntry>,
    transport: Option<Arc<dyn Transport>>,
    event_task: Option<JoinHandle<()>>,
    pending_join: Option<PendingJoin>,
    pending_send: Option<PendingSend>,
    closing_intentionally: bool,
}

/// The teacher-side client: roster observation, recipient-resolved
/// broadcasts, the reply permission switch, and the two history views
/// (inbound student messages, own sent log).
pub struct TeacherClient {
    connector: Arc<dyn TransportConnector>,
    store: Arc<dyn StateStore>,
    inner: Mutex<TeacherState>,
    events: broadcast::Sender<ClientEvent>,
}

impl TeacherClient {
    pub async fn new(
        connector: Arc<dyn TransportConnector>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>, ClientError> {
        let inbox = MessageCache::open(Arc::clone(&store), MessageLog::TeacherInbox).await?;
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            connector,
            store,
            inner: Mutex::new(TeacherState {
                session: SessionManager::new(),
                roster: Roster::default(),
                permission: PermissionGate::default(),
                inbox,
                sent_log: Vec::new(),
                transport: None,
                event_task: None,
                pending_join: None,
                pending_send: None,
                closing_intentionally: false,
            }),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Joins with pre-authenticated credentials. The relay acks a teacher
    /// join with the full roster (`student_list_update`), which this resolves
    /// with.
    pub async fn connect(
        self: &Arc<Self>,
        identity: TeacherIdentity,
    ) -> Result<Vec<RosterEntry>, ClientError> {
        self.store
            .save_identity(&StoredIdentity {
                role: Role::Teacher,
                teacher_code: identity.teacher_code.clone(),
                teacher_name: Some(identity.teacher_name.clone()),
                student_name: None,
            })
            .await
            .map_err(ClientError::Storage)?;

        let transport = self.connector.connect().await?;

        let ack_rx = {
            let mut inner = self.inner.lock().await;
            let generation = match inner.session.begin_join(identity.clone()) {
                Ok(generation) => generation,
                Err(err) => {
                    drop(inner);
                    transport.close().await;
                    return Err(err);
                }
            };
            if let Some(task) = inner.event_task.take() {
                task.abort();
            }
            let stale = inner.transport.take();
            let (respond, ack_rx) = oneshot::channel();
            inner.pending_join = Some(PendingJoin {
                generation,
                respond,
            });
            inner.transport = Some(Arc::clone(&transport));
            inner.event_task = Some(self.spawn_event_loop(transport.subscribe()));
            drop(inner);
            if let Some(stale) = stale {
                stale.close().await;
            }
            ack_rx
        };

        self.emit(ClientEvent::StateChanged(ConnectionState::Joining));
        transport
            .send(ClientRequest::TeacherJoin {
                teacher_code: identity.teacher_code,
                teacher_name: identity.teacher_name,
            })
            .await?;

        ack_rx.await.map_err(|_| {
            ClientError::transport("join attempt superseded or channel lost")
        })
    }

    pub async fn disconnect(&self) {
        let transport = {
            let mut inner = self.inner.lock().await;
            inner.closing_intentionally = true;
            inner.transport.clone()
        };
        match transport {
            Some(transport) => transport.close().await,
            None => {
                self.inner.lock().await.closing_intentionally = false;
            }
        }
    }

    /// Resolves the selection against the live roster, captures the display
    /// names for the later ack, and submits the message. Validation failures
    /// (empty body, no resolvable recipients) never reach the wire.
    pub async fn send_message(
        &self,
        selection: &Selection,
        text: &str,
    ) -> Result<(), ClientError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(ClientError::validation("message must not be empty"));
        }
        let (identity, transport, wire) = {
            let mut inner = self.inner.lock().await;
            if !inner.session.is_connected() {
                return Err(ClientError::protocol("not connected"));
            }
            let resolved = recipients::resolve(&inner.roster, selection)?;
            let identity = inner
                .session
                .identity()
                .cloned()
                .ok_or_else(|| ClientError::protocol("not connected"))?;
            let transport = inner
                .transport
                .clone()
                .ok_or_else(|| ClientError::protocol("not connected"))?;
            inner.pending_send = Some(PendingSend {
                display_names: resolved.display_names,
                is_all: resolved.is_all,
                body: body.to_string(),
            });
            (identity, transport, resolved.wire)
        };

        let result = transport
            .send(ClientRequest::SendMessage {
                sender_type: Role::Teacher,
                teacher_code: identity.teacher_code,
                message: body.to_string(),
                recipients: Some(wire),
                student_name: None,
            })
            .await;
        if result.is_err() {
            self.inner.lock().await.pending_send = None;
        }
        result
    }

    pub async fn toggle_receive(&self, allow: bool) -> Result<(), ClientError> {
        let transport = self.connected_transport().await?;
        transport
            .send(ClientRequest::TeacherToggleReceive { allow })
            .await
    }

    pub async fn kick_student(&self, socket_id: SocketId) -> Result<(), ClientError> {
        let transport = self.connected_transport().await?;
        transport
            .send(ClientRequest::KickStudent {
                student_socket_id: socket_id,
            })
            .await
    }

    /// Asks the relay to hard-delete a sent message. The sent log drops the
    /// entry on the ack, and recipients get a `message_deleted` broadcast.
    pub async fn delete_sent_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        let transport = self.connected_transport().await?;
        transport
            .send(ClientRequest::DeleteMessageTeacher { message_id })
            .await
    }

    pub async fn request_inbox(&self) -> Result<(), ClientError> {
        let transport = self.connected_transport().await?;
        transport.send(ClientRequest::GetTeacherMessages).await
    }

    pub async fn request_sent_messages(&self) -> Result<(), ClientError> {
        let transport = self.connected_transport().await?;
        transport.send(ClientRequest::GetSentMessages).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.session.state()
    }

    pub async fn roster(&self) -> Vec<RosterEntry> {
        self.inner.lock().await.roster.entries().to_vec()
    }

    pub async fn sent_log(&self) -> Vec<SentEntry> {
        self.inner.lock().await.sent_log.clone()
    }

    pub async fn inbox(&self) -> Vec<CachedMessage> {
        self.inner.lock().await.inbox.entries().to_vec()
    }

    pub async fn students_may_reply(&self) -> bool {
        self.inner.lock().await.permission.allows_student_send()
    }

    pub async fn restored_identity(&self) -> Result<Option<StoredIdentity>, ClientError> {
        self.store.load_identity().await.map_err(ClientError::Storage)
    }

    async fn connected_transport(&self) -> Result<Arc<dyn Transport>, ClientError> {
        let inner = self.inner.lock().await;
        if !inner.session.is_connected() {
            return Err(ClientError::protocol("not connected"));
        }
        inner
            .transport
            .clone()
            .ok_or_else(|| ClientError::protocol("not connected"))
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Event(event)) => client.handle_server_event(event).await,
                    Ok(TransportEvent::Malformed(err)) => {
                        client.notice(NoticeLevel::Error, format!("invalid server event: {err}"));
                    }
                    Ok(TransportEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        client.handle_transport_closed().await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "teacher event stream lagged");
                    }
                }
            }
        })
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::StudentListUpdate(entries) => self.handle_roster_update(entries).await,
            ServerEvent::StudentConnected(student) => {
                let name = student.student_name.clone();
                {
                    let mut inner = self.inner.lock().await;
                    inner.roster.apply_connected(&student);
                }
                self.emit(ClientEvent::RosterUpdated);
                self.notice(NoticeLevel::Info, format!("{name} joined"));
            }
            ServerEvent::StudentDisconnected(student) => {
                let removed = {
                    let mut inner = self.inner.lock().await;
                    inner.roster.apply_disconnected(&student.socket_id)
                };
                if removed {
                    self.emit(ClientEvent::RosterUpdated);
                    self.notice(
                        NoticeLevel::Warning,
                        format!("{} left", student.student_name),
                    );
                }
            }
            ServerEvent::ReceiveStatus { allow } => {
                let changed = {
                    let mut inner = self.inner.lock().await;
                    inner.permission.apply(allow)
                };
                if changed {
                    self.emit(ClientEvent::PermissionChanged(allow));
                }
            }
            ServerEvent::MessageSent { status, message_id } => {
                self.handle_message_sent(status, message_id).await;
            }
            ServerEvent::NewMessageFromStudent {
                id,
                student_name,
                message,
                timestamp,
            } => {
                self.handle_student_message(IncomingMessage {
                    id: Some(id),
                    sender: student_name,
                    body: message,
                    timestamp,
                    direction: Direction::ToTeacher,
                })
                .await;
            }
            ServerEvent::TeacherMessages { messages } => {
                let converted: Vec<IncomingMessage> = messages
                    .into_iter()
                    .map(|message| IncomingMessage {
                        id: Some(message.id),
                        sender: message.student_name,
                        body: message.message,
                        timestamp: message.timestamp,
                        direction: Direction::ToTeacher,
                    })
                    .collect();
                let result = {
                    let mut inner = self.inner.lock().await;
                    inner
                        .inbox
                        .merge_history(converted, HistoryMode::Replace)
                        .await
                };
                match result {
                    Ok(_) => self.emit(ClientEvent::InboxUpdated),
                    Err(err) => self.notice(
                        NoticeLevel::Error,
                        format!("failed to merge student messages: {err}"),
                    ),
                }
            }
            ServerEvent::SentMessages { messages } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.sent_log = messages.into_iter().map(SentEntry::from_record).collect();
                    inner.sent_log.truncate(SENT_LOG_CAP);
                }
                self.emit(ClientEvent::SentLogUpdated);
            }
            ServerEvent::DeleteResultTeacher {
                status,
                message_id,
                message,
            } => {
                self.handle_delete_result(status, message_id, message).await;
            }
            ServerEvent::KickResult {
                status,
                student_name,
                message,
            } => match status {
                DeliveryStatus::Success => self.notice(
                    NoticeLevel::Success,
                    format!(
                        "removed {}",
                        student_name.unwrap_or_else(|| "the student".to_string())
                    ),
                ),
                DeliveryStatus::Error => self.notice(
                    NoticeLevel::Warning,
                    message.unwrap_or_else(|| "the kick was rejected".to_string()),
                ),
            },
            ServerEvent::StudentJoinSuccess { .. }
            | ServerEvent::StudentJoinError { .. }
            | ServerEvent::MessageHistory { .. }
            | ServerEvent::ReceiveMessage { .. }
            | ServerEvent::DeleteResult { .. }
            | ServerEvent::MessageDeleted { .. }
            | ServerEvent::Kicked { .. }
            | ServerEvent::StudentMessageSent { .. }
            | ServerEvent::StudentMessageError { .. } => {
                debug!("ignoring student-facing event in a teacher session");
            }
        }
    }

    async fn handle_roster_update(&self, entries: Vec<RosterEntry>) {
        let ack = {
            let mut inner = self.inner.lock().await;
            inner.roster.replace_all(entries);
            match inner.pending_join.take() {
                Some(pending) => {
                    if inner.session.complete_join(pending.generation) {
                        Some((pending.respond, inner.roster.entries().to_vec()))
                    } else {
                        debug!("discarding roster ack for a superseded attempt");
                        None
                    }
                }
                None => None,
            }
        };

        self.emit(ClientEvent::RosterUpdated);

        if let Some((respond, roster)) = ack {
            self.emit(ClientEvent::StateChanged(ConnectionState::Connected));
            // Connected side effects: pull both history views.
            if let Err(err) = self.request_inbox().await {
                self.notice(
                    NoticeLevel::Error,
                    format!("failed to request student messages: {err}"),
                );
            }
            if let Err(err) = self.request_sent_messages().await {
                self.notice(
                    NoticeLevel::Error,
                    format!("failed to request sent history: {err}"),
                );
            }
            let _ = respond.send(roster);
        }
    }

    async fn handle_message_sent(&self, status: DeliveryStatus, message_id: MessageId) {
        let recorded = {
            let mut inner = self.inner.lock().await;
            let Some(pending) = inner.pending_send.take() else {
                debug!("send ack with nothing outstanding");
                return;
            };
            match status {
                DeliveryStatus::Success => {
                    let entry = SentEntry {
                        id: message_id,
                        label: recipients::format_recipient_label(
                            &pending.display_names,
                            pending.is_all,
                        ),
                        recipients: pending.display_names,
                        is_all: pending.is_all,
                        body: pending.body,
                        timestamp: Utc::now(),
                    };
                    inner.sent_log.insert(0, entry);
                    inner.sent_log.truncate(SENT_LOG_CAP);
                    true
                }
                DeliveryStatus::Error => false,
            }
        };

        if recorded {
            self.emit(ClientEvent::SentLogUpdated);
            self.notice(NoticeLevel::Success, "message delivered");
        } else {
            self.notice(NoticeLevel::Warning, "the server rejected the send");
        }
    }

    async fn handle_student_message(&self, incoming: IncomingMessage) {
        let sender = incoming.sender.clone();
        let delivered = {
            let mut inner = self.inner.lock().await;
            match inner.inbox.receive_live(incoming).await {
                Ok(delivered) => delivered.is_some(),
                Err(err) => {
                    drop(inner);
                    self.notice(
                        NoticeLevel::Error,
                        format!("failed to cache student message: {err}"),
                    );
                    return;
                }
            }
        };
        if delivered {
            self.emit(ClientEvent::InboxUpdated);
            self.notice(NoticeLevel::Info, format!("new message from {sender}"));
        }
    }

    async fn handle_delete_result(
        &self,
        status: DeliveryStatus,
        message_id: Option<MessageId>,
        message: Option<String>,
    ) {
        match status {
            DeliveryStatus::Success => {
                let removed = {
                    let mut inner = self.inner.lock().await;
                    let before = inner.sent_log.len();
                    if let Some(id) = message_id {
                        inner.sent_log.retain(|entry| entry.id != id);
                    }
                    inner.sent_log.len() != before
                };
                if removed {
                    self.emit(ClientEvent::SentLogUpdated);
                }
                self.notice(NoticeLevel::Success, "message deleted");
            }
            DeliveryStatus::Error => {
                self.notice(
                    NoticeLevel::Warning,
                    message.unwrap_or_else(|| "the delete was rejected".to_string()),
                );
            }
        }
    }

    async fn handle_transport_closed(&self) {
        let (changed, unconfirmed_send, intentional) = {
            let mut inner = self.inner.lock().await;
            inner.transport = None;
            inner.pending_join = None;
            let unconfirmed_send = inner.pending_send.take().is_some();
            let intentional = std::mem::take(&mut inner.closing_intentionally);
            let changed = inner.session.force_disconnect();
            inner.permission.reset();
            (changed, unconfirmed_send, intentional)
        };
        if unconfirmed_send {
            // The channel dropped before the ack; the send must not be
            // presented as delivered.
            self.notice(
                NoticeLevel::Warning,
                "the last send was not confirmed before the connection dropped",
            );
        }
        if changed {
            self.emit(ClientEvent::StateChanged(ConnectionState::Disconnected));
            if intentional {
                self.notice(NoticeLevel::Info, "disconnected");
            } else {
                self.notice(NoticeLevel::Error, "connection to the server was lost");
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(ClientEvent::Notice {
            level,
            text: text.into(),
        });
    }
}
