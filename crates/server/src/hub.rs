use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{
        DeliveryStatus, MessageId, RecipientSet, Role, RosterEntry, SocketId, StudentInfo,
        TeacherCode,
    },
    protocol::{ClientRequest, ServerEvent, TEACHER_SENDER_NAME},
};
use tracing::{info, warn};

use crate::store::MessageStore;

/// What a handler decided: events addressed to concrete sockets, plus any
/// sockets the connection layer must force-close (kicks).
#[derive(Debug, Default)]
pub struct Reply {
    pub sends: Vec<(SocketId, ServerEvent)>,
    pub closes: Vec<SocketId>,
}

impl Reply {
    fn to(socket: &SocketId, event: ServerEvent) -> Self {
        Self {
            sends: vec![(socket.clone(), event)],
            closes: Vec::new(),
        }
    }

    fn push(&mut self, socket: SocketId, event: ServerEvent) {
        self.sends.push((socket, event));
    }
}

#[derive(Debug, Clone)]
struct TeacherSession {
    teacher_code: TeacherCode,
}

/// Per-teacher room state and request dispatch. One instance behind a mutex;
/// the lock order of arriving frames is the event order of the system.
pub struct Hub {
    store: Arc<dyn MessageStore>,
    teachers: HashMap<SocketId, TeacherSession>,
    students: HashMap<SocketId, StudentInfo>,
}

impl Hub {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            teachers: HashMap::new(),
            students: HashMap::new(),
        }
    }

    fn teacher_room(&self, code: &TeacherCode) -> Vec<SocketId> {
        self.teachers
            .iter()
            .filter(|(_, session)| &session.teacher_code == code)
            .map(|(socket, _)| socket.clone())
            .collect()
    }

    fn student_room(&self, code: &TeacherCode) -> Vec<SocketId> {
        self.students
            .iter()
            .filter(|(_, info)| &info.teacher_code == code)
            .map(|(socket, _)| socket.clone())
            .collect()
    }

    fn fan_out(&self, reply: &mut Reply, room: Vec<SocketId>, event: ServerEvent) {
        for socket in room {
            reply.push(socket, event.clone());
        }
    }

    async fn roster_for(&self, code: &TeacherCode) -> Vec<RosterEntry> {
        let rows = match self.store.student_rows(code).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "failed to load student rows");
                Vec::new()
            }
        };
        rows.into_iter()
            .map(|row| {
                let is_online = self.students.contains_key(&row.socket_id);
                RosterEntry {
                    socket_id: row.socket_id,
                    student_name: row.student_name,
                    is_online,
                }
            })
            .collect()
    }

    pub async fn handle_request(&mut self, socket: &SocketId, request: ClientRequest) -> Reply {
        match request {
            ClientRequest::TeacherJoin {
                teacher_code,
                teacher_name,
            } => self.teacher_join(socket, teacher_code, teacher_name).await,
            ClientRequest::StudentJoin {
                teacher_code,
                student_name,
            } => self.student_join(socket, teacher_code, student_name).await,
            ClientRequest::GetMessageHistory {
                teacher_code,
                student_name,
            } => {
                let messages = self
                    .store
                    .history_for_student(&teacher_code, &student_name)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(%err, "history query failed");
                        Vec::new()
                    });
                Reply::to(socket, ServerEvent::MessageHistory { messages })
            }
            ClientRequest::SendMessage {
                sender_type,
                teacher_code,
                message,
                recipients,
                student_name,
            } => {
                self.send_message(socket, sender_type, teacher_code, message, recipients, student_name)
                    .await
            }
            ClientRequest::DeleteMessage {
                teacher_code,
                student_name,
                message_id,
            } => {
                match self
                    .store
                    .hide_for_student(message_id, &teacher_code, &student_name)
                    .await
                {
                    Ok(()) => Reply::to(
                        socket,
                        ServerEvent::DeleteResult {
                            status: DeliveryStatus::Success,
                            message_id: Some(message_id),
                            message: None,
                        },
                    ),
                    Err(err) => {
                        warn!(%err, "hide failed");
                        Reply::to(
                            socket,
                            ServerEvent::DeleteResult {
                                status: DeliveryStatus::Error,
                                message_id: None,
                                message: Some("삭제 중 오류가 발생했습니다.".to_string()),
                            },
                        )
                    }
                }
            }
            ClientRequest::DeleteMessageTeacher { message_id } => {
                self.delete_message_teacher(socket, message_id).await
            }
            ClientRequest::KickStudent { student_socket_id } => {
                self.kick_student(socket, student_socket_id)
            }
            ClientRequest::TeacherToggleReceive { allow } => {
                self.toggle_receive(socket, allow).await
            }
            ClientRequest::GetTeacherMessages => {
                let Some(session) = self.teachers.get(socket) else {
                    return Reply::to(
                        socket,
                        ServerEvent::TeacherMessages {
                            messages: Vec::new(),
                        },
                    );
                };
                let messages = self
                    .store
                    .teacher_inbox(&session.teacher_code)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(%err, "inbox query failed");
                        Vec::new()
                    });
                Reply::to(socket, ServerEvent::TeacherMessages { messages })
            }
            ClientRequest::GetSentMessages => {
                let Some(session) = self.teachers.get(socket) else {
                    return Reply::to(
                        socket,
                        ServerEvent::SentMessages {
                            messages: Vec::new(),
                        },
                    );
                };
                let messages = self
                    .store
                    .sent_messages(&session.teacher_code)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(%err, "sent query failed");
                        Vec::new()
                    });
                Reply::to(socket, ServerEvent::SentMessages { messages })
            }
        }
    }

    /// A socket went away. Students fan a `student_disconnected` to their
    /// teacher's room; teachers just deregister.
    pub async fn handle_disconnect(&mut self, socket: &SocketId) -> Reply {
        if self.teachers.remove(socket).is_some() {
            return Reply::default();
        }
        let Some(info) = self.students.remove(socket) else {
            return Reply::default();
        };
        info!(student = %info.student_name, teacher = %info.teacher_code, "student disconnected");
        let mut reply = Reply::default();
        let room = self.teacher_room(&info.teacher_code);
        self.fan_out(&mut reply, room, ServerEvent::StudentDisconnected(info));
        reply
    }

    async fn teacher_join(
        &mut self,
        socket: &SocketId,
        teacher_code: TeacherCode,
        teacher_name: String,
    ) -> Reply {
        if let Err(err) = self.store.register_teacher(&teacher_code, &teacher_name).await {
            warn!(%err, "failed to register teacher");
        }
        self.teachers.insert(
            socket.clone(),
            TeacherSession {
                teacher_code: teacher_code.clone(),
            },
        );

        let roster = self.roster_for(&teacher_code).await;
        let allow = self.store.allow_status(&teacher_code).await.unwrap_or(false);
        info!(teacher = %teacher_code, students = roster.len(), "teacher joined");

        let mut reply = Reply::to(socket, ServerEvent::StudentListUpdate(roster));
        reply.push(socket.clone(), ServerEvent::ReceiveStatus { allow });
        reply
    }

    async fn student_join(
        &mut self,
        socket: &SocketId,
        teacher_code: TeacherCode,
        student_name: String,
    ) -> Reply {
        let teacher_name = match self.store.teacher_name(&teacher_code).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                return Reply::to(
                    socket,
                    ServerEvent::StudentJoinError {
                        error: "유효하지 않은 교사 코드입니다.".to_string(),
                    },
                )
            }
            Err(err) => {
                warn!(%err, "teacher lookup failed");
                return Reply::to(
                    socket,
                    ServerEvent::StudentJoinError {
                        error: "연결 중 오류가 발생했습니다.".to_string(),
                    },
                );
            }
        };

        if let Err(err) = self
            .store
            .upsert_student(&teacher_code, &student_name, socket)
            .await
        {
            warn!(%err, "failed to persist student row");
        }

        // A reconnect under the same name supersedes the old connection in
        // the room registry as well, not only in the store.
        self.students.retain(|_, info| {
            !(info.teacher_code == teacher_code && info.student_name == student_name)
        });

        let student_info = StudentInfo {
            teacher_code: teacher_code.clone(),
            student_name: student_name.clone(),
            socket_id: socket.clone(),
            teacher_name: teacher_name.clone(),
        };
        self.students.insert(socket.clone(), student_info.clone());

        let allow = self.store.allow_status(&teacher_code).await.unwrap_or(false);
        info!(student = %student_name, teacher = %teacher_code, "student joined");

        let mut reply = Reply::to(
            socket,
            ServerEvent::StudentJoinSuccess {
                student_info: student_info.clone(),
                teacher_name,
                allow_messages: allow,
            },
        );
        let room = self.teacher_room(&teacher_code);
        self.fan_out(&mut reply, room, ServerEvent::StudentConnected(student_info));
        reply
    }

    async fn send_message(
        &mut self,
        socket: &SocketId,
        sender_type: Role,
        teacher_code: TeacherCode,
        message: String,
        recipients: Option<RecipientSet>,
        student_name: Option<String>,
    ) -> Reply {
        match sender_type {
            Role::Teacher => {
                let Some(recipients) = recipients else {
                    warn!("teacher send without recipients; dropping");
                    return Reply::default();
                };
                self.teacher_send(socket, teacher_code, message, recipients)
                    .await
            }
            Role::Student => {
                let student_name = student_name.unwrap_or_else(|| "학생".to_string());
                self.student_send(socket, teacher_code, student_name, message)
                    .await
            }
        }
    }

    async fn teacher_send(
        &mut self,
        socket: &SocketId,
        teacher_code: TeacherCode,
        message: String,
        recipients: RecipientSet,
    ) -> Reply {
        let mut reply = Reply::default();
        let (recipient_names, targets) = match &recipients {
            RecipientSet::All => {
                let room = self.student_room(&teacher_code);
                let names: Vec<String> = room
                    .iter()
                    .filter_map(|socket| self.students.get(socket))
                    .map(|info| info.student_name.clone())
                    .collect();
                (names, room)
            }
            RecipientSet::Students(ids) => {
                // Sockets that went away since selection simply drop out of
                // the fan-out.
                let targets: Vec<SocketId> = ids
                    .iter()
                    .filter(|id| self.students.contains_key(*id))
                    .cloned()
                    .collect();
                let names: Vec<String> = targets
                    .iter()
                    .filter_map(|socket| self.students.get(socket))
                    .map(|info| info.student_name.clone())
                    .collect();
                (names, targets)
            }
        };

        let recipient_field = if recipient_names.is_empty() && matches!(recipients, RecipientSet::All)
        {
            "all".to_string()
        } else {
            recipient_names.join(",")
        };

        let (message_id, timestamp) = match self
            .store
            .append_teacher_message(&teacher_code, &recipient_field, &message)
            .await
        {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(%err, "failed to persist message");
                return reply;
            }
        };

        let push = ServerEvent::ReceiveMessage {
            message_id: Some(message_id),
            sender: TEACHER_SENDER_NAME.to_string(),
            message,
            timestamp,
        };
        self.fan_out(&mut reply, targets, push);
        reply.push(
            socket.clone(),
            ServerEvent::MessageSent {
                status: DeliveryStatus::Success,
                message_id,
            },
        );
        reply
    }

    async fn student_send(
        &mut self,
        socket: &SocketId,
        teacher_code: TeacherCode,
        student_name: String,
        message: String,
    ) -> Reply {
        let allow = self.store.allow_status(&teacher_code).await.unwrap_or(false);
        if !allow {
            return Reply::to(
                socket,
                ServerEvent::StudentMessageError {
                    message: "교사가 현재 메시지 수신을 허용하지 않습니다.".to_string(),
                },
            );
        }

        let (message_id, timestamp) = match self
            .store
            .append_student_message(&teacher_code, &student_name, &message)
            .await
        {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(%err, "failed to persist student message");
                return Reply::to(
                    socket,
                    ServerEvent::StudentMessageError {
                        message: "메시지 전송 중 오류가 발생했습니다.".to_string(),
                    },
                );
            }
        };

        let mut reply = Reply::default();
        let room = self.teacher_room(&teacher_code);
        self.fan_out(
            &mut reply,
            room,
            ServerEvent::NewMessageFromStudent {
                id: message_id,
                student_name,
                message,
                timestamp,
            },
        );
        reply.push(
            socket.clone(),
            ServerEvent::StudentMessageSent {
                status: DeliveryStatus::Success,
                message_id,
            },
        );
        reply
    }

    async fn delete_message_teacher(&mut self, socket: &SocketId, message_id: MessageId) -> Reply {
        let Some(session) = self.teachers.get(socket).cloned() else {
            return Reply::to(
                socket,
                ServerEvent::DeleteResultTeacher {
                    status: DeliveryStatus::Error,
                    message_id: None,
                    message: Some("교사 인증에 실패했습니다.".to_string()),
                },
            );
        };

        let deleted = self
            .store
            .delete_teacher_message(message_id, &session.teacher_code)
            .await
            .unwrap_or(false);
        if !deleted {
            return Reply::to(
                socket,
                ServerEvent::DeleteResultTeacher {
                    status: DeliveryStatus::Error,
                    message_id: None,
                    message: Some("삭제 권한이 없거나 메시지가 없습니다.".to_string()),
                },
            );
        }

        let mut reply = Reply::default();
        let room = self.student_room(&session.teacher_code);
        self.fan_out(&mut reply, room, ServerEvent::MessageDeleted { message_id });
        reply.push(
            socket.clone(),
            ServerEvent::DeleteResultTeacher {
                status: DeliveryStatus::Success,
                message_id: Some(message_id),
                message: None,
            },
        );
        reply
    }

    fn kick_student(&mut self, socket: &SocketId, target: SocketId) -> Reply {
        let Some(session) = self.teachers.get(socket) else {
            return Reply::to(
                socket,
                ServerEvent::KickResult {
                    status: DeliveryStatus::Error,
                    student_name: None,
                    message: Some("교사 인증에 실패했습니다.".to_string()),
                },
            );
        };

        let Some(info) = self.students.get(&target) else {
            return Reply::to(
                socket,
                ServerEvent::KickResult {
                    status: DeliveryStatus::Error,
                    student_name: None,
                    message: Some("해당 학생을 찾을 수 없습니다.".to_string()),
                },
            );
        };

        if info.teacher_code != session.teacher_code {
            return Reply::to(
                socket,
                ServerEvent::KickResult {
                    status: DeliveryStatus::Error,
                    student_name: None,
                    message: Some("해당 학생을 내보낼 권한이 없습니다.".to_string()),
                },
            );
        }

        let student_name = info.student_name.clone();
        let mut reply = Reply::to(
            &target,
            ServerEvent::Kicked {
                reason: "teacher_kick".to_string(),
            },
        );
        reply.closes.push(target);
        reply.push(
            socket.clone(),
            ServerEvent::KickResult {
                status: DeliveryStatus::Success,
                student_name: Some(student_name),
                message: None,
            },
        );
        reply
    }

    async fn toggle_receive(&mut self, socket: &SocketId, allow: bool) -> Reply {
        let Some(session) = self.teachers.get(socket).cloned() else {
            return Reply::to(socket, ServerEvent::ReceiveStatus { allow: false });
        };

        if let Err(err) = self
            .store
            .set_allow_status(&session.teacher_code, allow)
            .await
        {
            warn!(%err, "failed to persist gate");
        }

        let mut reply = Reply::to(socket, ServerEvent::ReceiveStatus { allow });
        let room = self.student_room(&session.teacher_code);
        self.fan_out(&mut reply, room, ServerEvent::ReceiveStatus { allow });
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMessageStore;

    fn code() -> TeacherCode {
        "123456".parse().expect("code")
    }

    fn sid(raw: &str) -> SocketId {
        SocketId(raw.to_string())
    }

    async fn hub_with_teacher() -> (Hub, SocketId) {
        let mut hub = Hub::new(Arc::new(MemoryMessageStore::new()));
        let teacher = sid("t-1");
        hub.handle_request(
            &teacher,
            ClientRequest::TeacherJoin {
                teacher_code: code(),
                teacher_name: "Lee".to_string(),
            },
        )
        .await;
        (hub, teacher)
    }

    async fn join_student(hub: &mut Hub, socket: &SocketId, name: &str) {
        let reply = hub
            .handle_request(
                socket,
                ClientRequest::StudentJoin {
                    teacher_code: code(),
                    student_name: name.to_string(),
                },
            )
            .await;
        assert!(
            reply
                .sends
                .iter()
                .any(|(_, event)| matches!(event, ServerEvent::StudentJoinSuccess { .. })),
            "join should succeed"
        );
    }

    fn receive_targets(reply: &Reply) -> Vec<SocketId> {
        reply
            .sends
            .iter()
            .filter(|(_, event)| matches!(event, ServerEvent::ReceiveMessage { .. }))
            .map(|(socket, _)| socket.clone())
            .collect()
    }

    #[tokio::test]
    async fn unknown_teacher_code_rejects_the_join() {
        let mut hub = Hub::new(Arc::new(MemoryMessageStore::new()));
        let reply = hub
            .handle_request(
                &sid("s-1"),
                ClientRequest::StudentJoin {
                    teacher_code: code(),
                    student_name: "Kim".to_string(),
                },
            )
            .await;
        assert!(matches!(
            reply.sends.as_slice(),
            [(_, ServerEvent::StudentJoinError { .. })]
        ));
    }

    #[tokio::test]
    async fn teacher_join_acks_with_roster_then_gate() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let reply = hub
            .handle_request(
                &teacher,
                ClientRequest::TeacherJoin {
                    teacher_code: code(),
                    teacher_name: "Lee".to_string(),
                },
            )
            .await;
        match reply.sends.as_slice() {
            [(to_roster, ServerEvent::StudentListUpdate(roster)), (to_status, ServerEvent::ReceiveStatus { allow })] =>
            {
                assert_eq!(to_roster, &teacher);
                assert_eq!(to_status, &teacher);
                assert_eq!(roster.len(), 1);
                assert!(roster[0].is_online);
                assert!(!allow, "gate defaults to deny");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_online_student_once() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;
        join_student(&mut hub, &sid("s-2"), "Park").await;
        join_student(&mut hub, &sid("s-3"), "Choi").await;

        let reply = hub
            .handle_request(
                &teacher,
                ClientRequest::SendMessage {
                    sender_type: Role::Teacher,
                    teacher_code: code(),
                    message: "내일 시험입니다".to_string(),
                    recipients: Some(RecipientSet::All),
                    student_name: None,
                },
            )
            .await;

        let mut targets = receive_targets(&reply);
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(targets, vec![sid("s-1"), sid("s-2"), sid("s-3")]);
        assert!(reply
            .sends
            .iter()
            .any(|(socket, event)| socket == &teacher
                && matches!(event, ServerEvent::MessageSent { status: DeliveryStatus::Success, .. })));

        // A student joining after the send receives nothing retroactively.
        join_student(&mut hub, &sid("s-4"), "Jung").await;
        let late_history = hub
            .handle_request(
                &sid("s-4"),
                ClientRequest::GetMessageHistory {
                    teacher_code: code(),
                    student_name: "Jung".to_string(),
                },
            )
            .await;
        // The broadcast is in history (addressed to all), but no live push
        // ever targeted s-4.
        assert!(receive_targets(&late_history).is_empty());
    }

    #[tokio::test]
    async fn subset_send_skips_sockets_that_went_offline() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;
        join_student(&mut hub, &sid("s-2"), "Park").await;
        hub.handle_disconnect(&sid("s-2")).await;

        let reply = hub
            .handle_request(
                &teacher,
                ClientRequest::SendMessage {
                    sender_type: Role::Teacher,
                    teacher_code: code(),
                    message: "hello".to_string(),
                    recipients: Some(RecipientSet::Students(vec![sid("s-1"), sid("s-2")])),
                    student_name: None,
                },
            )
            .await;

        assert_eq!(receive_targets(&reply), vec![sid("s-1")]);
    }

    #[tokio::test]
    async fn same_name_reconnect_fans_a_single_connected_event() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;
        join_student(&mut hub, &sid("s-2"), "Kim").await;

        // The stale registration is gone: an all-send targets only the new
        // socket.
        let reply = hub
            .handle_request(
                &teacher,
                ClientRequest::SendMessage {
                    sender_type: Role::Teacher,
                    teacher_code: code(),
                    message: "hello".to_string(),
                    recipients: Some(RecipientSet::All),
                    student_name: None,
                },
            )
            .await;
        assert_eq!(receive_targets(&reply), vec![sid("s-2")]);
    }

    #[tokio::test]
    async fn student_disconnect_notifies_the_teacher_room() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let reply = hub.handle_disconnect(&sid("s-1")).await;
        match reply.sends.as_slice() {
            [(socket, ServerEvent::StudentDisconnected(info))] => {
                assert_eq!(socket, &teacher);
                assert_eq!(info.student_name, "Kim");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn kick_pushes_then_closes_the_target() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let reply = hub
            .handle_request(
                &teacher,
                ClientRequest::KickStudent {
                    student_socket_id: sid("s-1"),
                },
            )
            .await;

        assert!(reply
            .sends
            .iter()
            .any(|(socket, event)| socket == &sid("s-1")
                && matches!(event, ServerEvent::Kicked { .. })));
        assert_eq!(reply.closes, vec![sid("s-1")]);
        assert!(reply.sends.iter().any(|(socket, event)| socket == &teacher
            && matches!(
                event,
                ServerEvent::KickResult {
                    status: DeliveryStatus::Success,
                    ..
                }
            )));
    }

    #[tokio::test]
    async fn kick_requires_an_authenticated_owning_teacher() {
        let (mut hub, _teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let reply = hub
            .handle_request(
                &sid("impostor"),
                ClientRequest::KickStudent {
                    student_socket_id: sid("s-1"),
                },
            )
            .await;
        assert!(matches!(
            reply.sends.as_slice(),
            [(
                _,
                ServerEvent::KickResult {
                    status: DeliveryStatus::Error,
                    ..
                }
            )]
        ));
        assert!(reply.closes.is_empty());
    }

    #[tokio::test]
    async fn gate_toggle_fans_to_the_student_room() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let reply = hub
            .handle_request(&teacher, ClientRequest::TeacherToggleReceive { allow: true })
            .await;

        let statuses: Vec<&SocketId> = reply
            .sends
            .iter()
            .filter(|(_, event)| matches!(event, ServerEvent::ReceiveStatus { allow: true }))
            .map(|(socket, _)| socket)
            .collect();
        assert!(statuses.contains(&&teacher));
        assert!(statuses.contains(&&sid("s-1")));
    }

    #[tokio::test]
    async fn student_sends_are_gated() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let denied = hub
            .handle_request(
                &sid("s-1"),
                ClientRequest::SendMessage {
                    sender_type: Role::Student,
                    teacher_code: code(),
                    message: "질문 있어요".to_string(),
                    recipients: None,
                    student_name: Some("Kim".to_string()),
                },
            )
            .await;
        assert!(matches!(
            denied.sends.as_slice(),
            [(_, ServerEvent::StudentMessageError { .. })]
        ));

        hub.handle_request(&teacher, ClientRequest::TeacherToggleReceive { allow: true })
            .await;

        let accepted = hub
            .handle_request(
                &sid("s-1"),
                ClientRequest::SendMessage {
                    sender_type: Role::Student,
                    teacher_code: code(),
                    message: "질문 있어요".to_string(),
                    recipients: None,
                    student_name: Some("Kim".to_string()),
                },
            )
            .await;
        assert!(accepted.sends.iter().any(|(socket, event)| socket == &teacher
            && matches!(event, ServerEvent::NewMessageFromStudent { .. })));
        assert!(accepted
            .sends
            .iter()
            .any(|(socket, event)| socket == &sid("s-1")
                && matches!(event, ServerEvent::StudentMessageSent { .. })));
    }

    #[tokio::test]
    async fn teacher_delete_broadcasts_removal_to_students() {
        let (mut hub, teacher) = hub_with_teacher().await;
        join_student(&mut hub, &sid("s-1"), "Kim").await;

        let send = hub
            .handle_request(
                &teacher,
                ClientRequest::SendMessage {
                    sender_type: Role::Teacher,
                    teacher_code: code(),
                    message: "oops".to_string(),
                    recipients: Some(RecipientSet::All),
                    student_name: None,
                },
            )
            .await;
        let message_id = send
            .sends
            .iter()
            .find_map(|(_, event)| match event {
                ServerEvent::MessageSent { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .expect("ack");

        let reply = hub
            .handle_request(&teacher, ClientRequest::DeleteMessageTeacher { message_id })
            .await;
        assert!(reply
            .sends
            .iter()
            .any(|(socket, event)| socket == &sid("s-1")
                && matches!(event, ServerEvent::MessageDeleted { .. })));
        assert!(reply.sends.iter().any(|(socket, event)| socket == &teacher
            && matches!(
                event,
                ServerEvent::DeleteResultTeacher {
                    status: DeliveryStatus::Success,
                    ..
                }
            )));

        // Gone from a later history fetch too.
        let history = hub
            .handle_request(
                &sid("s-1"),
                ClientRequest::GetMessageHistory {
                    teacher_code: code(),
                    student_name: "Kim".to_string(),
                },
            )
            .await;
        match history.sends.as_slice() {
            [(_, ServerEvent::MessageHistory { messages })] => assert!(messages.is_empty()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
