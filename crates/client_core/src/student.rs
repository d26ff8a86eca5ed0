use std::sync::Arc;

use shared::{
    domain::{DeliveryStatus, MessageId, Role, StudentInfo},
    protocol::{ClientRequest, HistoryMessage, ServerEvent},
};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    cache::{Direction, IncomingMessage, MessageCache, MessageKey},
    durable::{MessageLog, StateStore, StoredIdentity},
    error::ClientError,
    notify::{Notifier, Surface},
    permission::PermissionGate,
    read::ReadTracker,
    schedule::{TaskKey, TaskScheduler},
    session::{ConnectionState, SessionManager, StudentIdentity},
    transport::{Transport, TransportConnector, TransportEvent},
    CachedMessage, ClientConfig, ClientEvent, NoticeLevel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    pub teacher_name: String,
}

struct PendingJoin {
    generation: u64,
    respond: oneshot::Sender<Result<JoinAck, String>>,
}

struct StudentState {
    session: SessionManager<StudentIdentity>,
    cache: MessageCache,
    permission: PermissionGate,
    surface: Surface,
    transport: Option<Arc<dyn Transport>>,
    event_task: Option<JoinHandle<()>>,
    pending_join: Option<PendingJoin>,
    closing_intentionally: bool,
}

/// The student-side client: join lifecycle, the durable message cache,
/// read/unread tracking, and the permission-gated reply path. All
/// collaborators are injected; there is no ambient state.
pub struct StudentClient {
    connector: Arc<dyn TransportConnector>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<TaskScheduler>,
    read_tracker: ReadTracker,
    config: ClientConfig,
    inner: Mutex<StudentState>,
    events: broadcast::Sender<ClientEvent>,
}

impl StudentClient {
    pub async fn new(
        connector: Arc<dyn TransportConnector>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        config: ClientConfig,
    ) -> Result<Arc<Self>, ClientError> {
        let cache = MessageCache::open(Arc::clone(&store), MessageLog::StudentInbox).await?;
        let scheduler = Arc::new(TaskScheduler::new());
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            connector,
            store,
            notifier,
            read_tracker: ReadTracker::new(Arc::clone(&scheduler)),
            scheduler,
            config,
            inner: Mutex::new(StudentState {
                session: SessionManager::new(),
                cache,
                permission: PermissionGate::default(),
                surface: Surface::Foreground,
                transport: None,
                event_task: None,
                pending_join: None,
                closing_intentionally: false,
            }),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Validates the identity, opens a fresh channel, sends the join request
    /// and resolves with the join result. A second call while an attempt is
    /// outstanding supersedes it; the superseded caller's future resolves
    /// with a transport error and any late result for it is discarded.
    pub async fn connect(
        self: &Arc<Self>,
        teacher_code: &str,
        student_name: &str,
    ) -> Result<JoinAck, ClientError> {
        let identity = StudentIdentity::parse(teacher_code, student_name)?;

        self.store
            .save_identity(&StoredIdentity {
                role: Role::Student,
                teacher_code: identity.teacher_code.clone(),
                teacher_name: None,
                student_name: Some(identity.student_name.clone()),
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
            .send(ClientRequest::StudentJoin {
                teacher_code: identity.teacher_code,
                student_name: identity.student_name,
            })
            .await?;

        match ack_rx.await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(error)) => Err(ClientError::Protocol(error)),
            Err(_) => Err(ClientError::transport(
                "join attempt superseded or channel lost",
            )),
        }
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

    pub async fn request_history(&self) -> Result<(), ClientError> {
        let (identity, transport) = self.connected_context().await?;
        transport
            .send(ClientRequest::GetMessageHistory {
                teacher_code: identity.teacher_code,
                student_name: identity.student_name,
            })
            .await
    }

    /// Student→teacher reply. Checked locally against the permission gate
    /// before anything touches the wire.
    pub async fn send_reply(&self, text: &str) -> Result<(), ClientError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(ClientError::validation("message must not be empty"));
        }
        let (identity, transport) = {
            let inner = self.inner.lock().await;
            if !inner.session.is_connected() {
                return Err(ClientError::protocol("not connected"));
            }
            if !inner.permission.allows_student_send() {
                return Err(ClientError::validation(
                    "the teacher is not accepting replies right now",
                ));
            }
            let identity = inner
                .session
                .identity()
                .cloned()
                .ok_or_else(|| ClientError::protocol("not connected"))?;
            let transport = inner
                .transport
                .clone()
                .ok_or_else(|| ClientError::protocol("not connected"))?;
            (identity, transport)
        };
        transport
            .send(ClientRequest::SendMessage {
                sender_type: Role::Student,
                teacher_code: identity.teacher_code,
                message: body.to_string(),
                recipients: None,
                student_name: Some(identity.student_name),
            })
            .await
    }

    /// Hides one message: removed locally first, then corroborated by the
    /// server. A later rejection surfaces a notice but never resurrects the
    /// entry.
    pub async fn delete_message(&self, key: MessageKey) -> Result<(), ClientError> {
        let (removed, unread, context) = {
            let mut inner = self.inner.lock().await;
            let removed = inner.cache.remove(key).await?;
            let unread = inner.cache.unread_count();
            let context = match (
                inner.session.is_connected(),
                inner.session.identity().cloned(),
                inner.transport.clone(),
            ) {
                (true, Some(identity), Some(transport)) => Some((identity, transport)),
                _ => None,
            };
            (removed, unread, context)
        };
        self.scheduler.cancel(&TaskKey::AutoRead(key)).await;
        if removed {
            self.emit(ClientEvent::MessagesUpdated);
            self.emit(ClientEvent::UnreadChanged(unread));
        }
        if let (MessageKey::Server(message_id), Some((identity, transport))) = (key, context) {
            transport
                .send(ClientRequest::DeleteMessage {
                    teacher_code: identity.teacher_code,
                    student_name: identity.student_name,
                    message_id,
                })
                .await?;
        }
        Ok(())
    }

    /// Empties the cache in one persisted step. Confirmation is the UI's job.
    pub async fn clear_messages(&self) -> Result<(), ClientError> {
        {
            let mut inner = self.inner.lock().await;
            inner.cache.clear().await?;
        }
        self.scheduler.cancel_all().await;
        self.emit(ClientEvent::MessagesUpdated);
        self.emit(ClientEvent::UnreadChanged(0));
        self.notice(NoticeLevel::Success, "all messages cleared");
        Ok(())
    }

    pub async fn mark_read(&self, key: MessageKey) -> Result<bool, ClientError> {
        let (changed, unread) = {
            let mut inner = self.inner.lock().await;
            let changed = self.read_tracker.mark_read(&mut inner.cache, key).await?;
            (changed, inner.cache.unread_count())
        };
        if changed {
            self.emit(ClientEvent::MessagesUpdated);
            self.emit(ClientEvent::UnreadChanged(unread));
        }
        Ok(changed)
    }

    pub async fn mark_all_read(&self) -> Result<usize, ClientError> {
        let changed = {
            let mut inner = self.inner.lock().await;
            self.read_tracker.mark_all_read(&mut inner.cache).await?
        };
        if changed > 0 {
            self.emit(ClientEvent::MessagesUpdated);
            self.emit(ClientEvent::UnreadChanged(0));
        }
        Ok(changed)
    }

    /// Foreground/background flips from the UI shell. Returning to the
    /// foreground while connected schedules the debounced mark-all-read
    /// sweep; repeated flips collapse onto one pending sweep.
    pub async fn set_surface(self: &Arc<Self>, surface: Surface) {
        let (was, connected) = {
            let mut inner = self.inner.lock().await;
            let was = inner.surface;
            inner.surface = surface;
            (was, inner.session.is_connected())
        };
        match surface {
            Surface::Foreground if was == Surface::Background && connected => {
                let client = Arc::clone(self);
                self.scheduler
                    .schedule(
                        TaskKey::VisibilitySweep,
                        self.config.visibility_sweep_debounce,
                        async move {
                            if let Err(err) = client.mark_all_read().await {
                                warn!(%err, "visibility sweep failed");
                            }
                        },
                    )
                    .await;
            }
            Surface::Background => {
                self.scheduler.cancel(&TaskKey::VisibilitySweep).await;
            }
            Surface::Foreground => {}
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.session.state()
    }

    pub async fn messages(&self) -> Vec<CachedMessage> {
        self.inner.lock().await.cache.entries().to_vec()
    }

    pub async fn unread_count(&self) -> usize {
        self.inner.lock().await.cache.unread_count()
    }

    pub async fn replies_allowed(&self) -> bool {
        self.inner.lock().await.permission.allows_student_send()
    }

    /// Identity remembered from the last session, for login prefill.
    pub async fn restored_identity(&self) -> Result<Option<StoredIdentity>, ClientError> {
        self.store.load_identity().await.map_err(ClientError::Storage)
    }

    async fn connected_context(
        &self,
    ) -> Result<(StudentIdentity, Arc<dyn Transport>), ClientError> {
        let inner = self.inner.lock().await;
        if !inner.session.is_connected() {
            return Err(ClientError::protocol("not connected"));
        }
        let identity = inner
            .session
            .identity()
            .cloned()
            .ok_or_else(|| ClientError::protocol("not connected"))?;
        let transport = inner
            .transport
            .clone()
            .ok_or_else(|| ClientError::protocol("not connected"))?;
        Ok((identity, transport))
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
                        warn!(skipped, "student event stream lagged");
                    }
                }
            }
        })
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::StudentJoinSuccess {
                student_info,
                teacher_name,
                allow_messages,
            } => {
                self.handle_join_success(student_info, teacher_name, allow_messages)
                    .await;
            }
            ServerEvent::StudentJoinError { error } => self.handle_join_error(error).await,
            ServerEvent::MessageHistory { messages } => self.handle_history(messages).await,
            ServerEvent::ReceiveMessage {
                message_id,
                sender,
                message,
                timestamp,
            } => {
                self.handle_receive(IncomingMessage {
                    id: message_id,
                    sender,
                    body: message,
                    timestamp,
                    direction: Direction::ToStudent,
                })
                .await;
            }
            ServerEvent::DeleteResult {
                status, message, ..
            } => {
                if status == DeliveryStatus::Error {
                    // Local removal stands; a fresh history fetch is the only
                    // way the entry comes back.
                    self.notice(
                        NoticeLevel::Warning,
                        message.unwrap_or_else(|| "the server rejected the delete".to_string()),
                    );
                }
            }
            ServerEvent::MessageDeleted { message_id } => {
                self.handle_message_deleted(message_id).await;
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
            ServerEvent::Kicked { .. } => self.handle_kicked().await,
            ServerEvent::StudentMessageSent { status, .. } => {
                if status == DeliveryStatus::Success {
                    self.notice(NoticeLevel::Success, "reply delivered");
                }
            }
            ServerEvent::StudentMessageError { message } => {
                self.notice(NoticeLevel::Warning, message);
            }
            ServerEvent::MessageSent { .. }
            | ServerEvent::DeleteResultTeacher { .. }
            | ServerEvent::StudentConnected(_)
            | ServerEvent::StudentDisconnected(_)
            | ServerEvent::StudentListUpdate(_)
            | ServerEvent::KickResult { .. }
            | ServerEvent::NewMessageFromStudent { .. }
            | ServerEvent::TeacherMessages { .. }
            | ServerEvent::SentMessages { .. } => {
                debug!("ignoring teacher-facing event in a student session");
            }
        }
    }

    async fn handle_join_success(
        &self,
        student_info: StudentInfo,
        teacher_name: String,
        allow_messages: bool,
    ) {
        let (respond, permission_changed, identity) = {
            let mut inner = self.inner.lock().await;
            let Some(identity) = inner.session.identity().cloned() else {
                debug!("discarding join success with no identity");
                return;
            };
            // The echo is the response tag: a result for another identity
            // belongs to a superseded attempt.
            if student_info.student_name != identity.student_name
                || student_info.teacher_code != identity.teacher_code
            {
                debug!("discarding join success for a superseded identity");
                return;
            }
            let Some(pending) = inner.pending_join.take() else {
                debug!("discarding join success with no attempt outstanding");
                return;
            };
            if !inner.session.complete_join(pending.generation) {
                debug!("discarding join success for a superseded attempt");
                return;
            }
            let permission_changed = inner.permission.apply(allow_messages);
            (pending.respond, permission_changed, identity)
        };

        let record = StoredIdentity {
            role: Role::Student,
            teacher_code: identity.teacher_code,
            teacher_name: Some(teacher_name.clone()),
            student_name: Some(identity.student_name),
        };
        if let Err(err) = self.store.save_identity(&record).await {
            warn!(%err, "failed to persist session identity");
        }

        self.emit(ClientEvent::StateChanged(ConnectionState::Connected));
        if permission_changed {
            self.emit(ClientEvent::PermissionChanged(allow_messages));
        }

        // A connected session always has its history request outstanding or
        // satisfied.
        if let Err(err) = self.request_history().await {
            self.notice(
                NoticeLevel::Error,
                format!("failed to request history: {err}"),
            );
        }

        let _ = respond.send(Ok(JoinAck { teacher_name }));
    }

    async fn handle_join_error(&self, error: String) {
        let (respond, transport) = {
            let mut inner = self.inner.lock().await;
            let Some(pending) = inner.pending_join.take() else {
                debug!("discarding join error with no attempt outstanding");
                return;
            };
            if !inner.session.fail_join(pending.generation) {
                debug!("discarding join error for a superseded attempt");
                return;
            }
            (pending.respond, inner.transport.take())
        };
        self.emit(ClientEvent::StateChanged(ConnectionState::Disconnected));
        self.notice(NoticeLevel::Warning, error.clone());
        let _ = respond.send(Err(error));
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    async fn handle_history(&self, messages: Vec<HistoryMessage>) {
        let count = messages.len();
        let converted: Vec<IncomingMessage> = messages
            .into_iter()
            .map(|message| IncomingMessage {
                id: Some(message.id),
                sender: message.sender,
                body: message.message,
                timestamp: message.timestamp,
                direction: Direction::ToStudent,
            })
            .collect();

        let unread = {
            let mut inner = self.inner.lock().await;
            let mode = self.config.history_mode;
            if let Err(err) = inner.cache.merge_history(converted, mode).await {
                drop(inner);
                self.notice(NoticeLevel::Error, format!("failed to merge history: {err}"));
                return;
            }
            inner.cache.unread_count()
        };

        self.emit(ClientEvent::MessagesUpdated);
        self.emit(ClientEvent::UnreadChanged(unread));
        if count > 0 {
            self.notice(
                NoticeLevel::Info,
                format!("loaded {count} earlier messages"),
            );
        }
    }

    async fn handle_receive(self: &Arc<Self>, incoming: IncomingMessage) {
        let delivered = {
            let mut inner = self.inner.lock().await;
            let surface = inner.surface;
            match inner.cache.receive_live(incoming).await {
                Ok(Some(key)) => {
                    let entry = inner.cache.get(key).cloned();
                    let unread = inner.cache.unread_count();
                    entry.map(|entry| (key, entry, unread, surface))
                }
                Ok(None) => None,
                Err(err) => {
                    drop(inner);
                    self.notice(NoticeLevel::Error, format!("failed to cache message: {err}"));
                    return;
                }
            }
        };

        let Some((key, entry, unread, surface)) = delivered else {
            return;
        };

        self.emit(ClientEvent::MessagesUpdated);
        self.emit(ClientEvent::UnreadChanged(unread));
        self.notifier.message_received(&entry, surface);

        if surface == Surface::Foreground {
            // The user is looking at the surface; the message counts as seen
            // shortly, unless something marks it read (or removes it) first.
            let client = Arc::clone(self);
            self.scheduler
                .schedule(
                    TaskKey::AutoRead(key),
                    self.config.auto_read_delay,
                    async move {
                        if let Err(err) = client.mark_read(key).await {
                            warn!(%err, "auto-read failed");
                        }
                    },
                )
                .await;
        }
    }

    async fn handle_message_deleted(&self, message_id: MessageId) {
        let (removed, unread) = {
            let mut inner = self.inner.lock().await;
            match inner.cache.remove_server_id(message_id).await {
                Ok(removed) => (removed, inner.cache.unread_count()),
                Err(err) => {
                    drop(inner);
                    self.notice(
                        NoticeLevel::Error,
                        format!("failed to apply deletion: {err}"),
                    );
                    return;
                }
            }
        };
        self.scheduler
            .cancel(&TaskKey::AutoRead(MessageKey::Server(message_id)))
            .await;
        if removed {
            self.emit(ClientEvent::MessagesUpdated);
            self.emit(ClientEvent::UnreadChanged(unread));
        }
    }

    async fn handle_kicked(&self) {
        self.notice(NoticeLevel::Warning, "the teacher ended this session");
        self.emit(ClientEvent::Kicked);
        let transport = self.inner.lock().await.transport.clone();
        if let Some(transport) = transport {
            // A kicked client must not linger as "connected" in its own view.
            transport.close().await;
        }
    }

    async fn handle_transport_closed(&self) {
        let (changed, was_allowing, intentional) = {
            let mut inner = self.inner.lock().await;
            inner.transport = None;
            inner.pending_join = None;
            let intentional = std::mem::take(&mut inner.closing_intentionally);
            let changed = inner.session.force_disconnect();
            let was_allowing = inner.permission.reset();
            (changed, was_allowing, intentional)
        };
        self.scheduler.cancel(&TaskKey::VisibilitySweep).await;
        if changed {
            self.emit(ClientEvent::StateChanged(ConnectionState::Disconnected));
            if intentional {
                self.notice(NoticeLevel::Info, "disconnected");
            } else {
                self.notice(NoticeLevel::Error, "connection to the server was lost");
            }
        }
        if was_allowing {
            self.emit(ClientEvent::PermissionChanged(false));
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
