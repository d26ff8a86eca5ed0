use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DeliveryStatus, MessageId, RecipientSet, Role, RosterEntry, SocketId, StudentInfo, TeacherCode,
};

/// Display name carried on every teacher-authored message. The relay sends
/// the literal label, not the teacher's registered name.
pub const TEACHER_SENDER_NAME: &str = "교사";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    TeacherJoin {
        teacher_code: TeacherCode,
        teacher_name: String,
    },
    StudentJoin {
        teacher_code: TeacherCode,
        student_name: String,
    },
    GetMessageHistory {
        teacher_code: TeacherCode,
        student_name: String,
    },
    SendMessage {
        sender_type: Role,
        teacher_code: TeacherCode,
        message: String,
        /// Present on teacher sends; student replies are implicitly addressed
        /// to the teacher room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipients: Option<RecipientSet>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        student_name: Option<String>,
    },
    DeleteMessage {
        teacher_code: TeacherCode,
        student_name: String,
        message_id: MessageId,
    },
    DeleteMessageTeacher {
        message_id: MessageId,
    },
    KickStudent {
        student_socket_id: SocketId,
    },
    TeacherToggleReceive {
        allow: bool,
    },
    GetTeacherMessages,
    GetSentMessages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub sender: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundStudentMessage {
    pub id: MessageId,
    pub student_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessageRecord {
    pub id: MessageId,
    /// Stored recipient descriptor: `"all"` or the comma-joined display names
    /// captured when the message was sent.
    pub recipient: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    StudentJoinSuccess {
        student_info: StudentInfo,
        teacher_name: String,
        allow_messages: bool,
    },
    StudentJoinError {
        error: String,
    },
    MessageHistory {
        messages: Vec<HistoryMessage>,
    },
    MessageSent {
        status: DeliveryStatus,
        message_id: MessageId,
    },
    ReceiveMessage {
        /// Absent on relay variants that push before the record is stamped;
        /// the client falls back to `(body, timestamp)` for dedup until a
        /// stamped copy arrives.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        sender: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    DeleteResult {
        status: DeliveryStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    DeleteResultTeacher {
        status: DeliveryStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    StudentConnected(StudentInfo),
    StudentDisconnected(StudentInfo),
    StudentListUpdate(Vec<RosterEntry>),
    KickResult {
        status: DeliveryStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        student_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Kicked {
        reason: String,
    },
    ReceiveStatus {
        allow: bool,
    },
    NewMessageFromStudent {
        id: MessageId,
        student_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    StudentMessageSent {
        status: DeliveryStatus,
        message_id: MessageId,
    },
    StudentMessageError {
        message: String,
    },
    TeacherMessages {
        messages: Vec<InboundStudentMessage>,
    },
    SentMessages {
        messages: Vec<SentMessageRecord>,
    },
}
