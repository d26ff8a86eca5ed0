use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, SocketId, TeacherCode},
    protocol::{HistoryMessage, InboundStudentMessage, SentMessageRecord, TEACHER_SENDER_NAME},
};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// Newest 50 visible records go back to a student on a history request.
pub const STUDENT_HISTORY_LIMIT: usize = 50;
/// Newest 100 records for each of the teacher's two full-history views.
pub const TEACHER_HISTORY_LIMIT: usize = 100;
/// The per-teacher inbox of student messages is trimmed to this many.
pub const TEACHER_INBOX_CAP: usize = 1000;

/// Per-student hide scope, `<code>::<name>`.
pub fn student_key(teacher_code: &TeacherCode, student_name: &str) -> String {
    format!("{}::{}", teacher_code.as_str(), student_name)
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub student_name: String,
    pub socket_id: SocketId,
}

/// The relay's persistence seam. Per the system boundary this is an opaque
/// store reachable only through these operations; the bundled implementation
/// is in-memory.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn register_teacher(&self, code: &TeacherCode, name: &str) -> Result<()>;
    async fn teacher_name(&self, code: &TeacherCode) -> Result<Option<String>>;

    async fn allow_status(&self, code: &TeacherCode) -> Result<bool>;
    async fn set_allow_status(&self, code: &TeacherCode, allow: bool) -> Result<()>;

    /// Replaces any same-name rows for this teacher, then inserts.
    async fn upsert_student(
        &self,
        code: &TeacherCode,
        student_name: &str,
        socket_id: &SocketId,
    ) -> Result<()>;
    async fn student_rows(&self, code: &TeacherCode) -> Result<Vec<StudentRow>>;

    async fn append_teacher_message(
        &self,
        code: &TeacherCode,
        recipient: &str,
        body: &str,
    ) -> Result<(MessageId, DateTime<Utc>)>;
    async fn append_student_message(
        &self,
        code: &TeacherCode,
        student_name: &str,
        body: &str,
    ) -> Result<(MessageId, DateTime<Utc>)>;

    /// Teacher-authored records addressed to this student (or to everyone),
    /// minus the ones the student has hidden; newest first.
    async fn history_for_student(
        &self,
        code: &TeacherCode,
        student_name: &str,
    ) -> Result<Vec<HistoryMessage>>;
    async fn hide_for_student(
        &self,
        message_id: MessageId,
        code: &TeacherCode,
        student_name: &str,
    ) -> Result<()>;
    /// Hard delete. Returns false when the record does not exist or belongs
    /// to another teacher.
    async fn delete_teacher_message(
        &self,
        message_id: MessageId,
        code: &TeacherCode,
    ) -> Result<bool>;

    async fn teacher_inbox(&self, code: &TeacherCode) -> Result<Vec<InboundStudentMessage>>;
    async fn sent_messages(&self, code: &TeacherCode) -> Result<Vec<SentMessageRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Author {
    Teacher,
    Student,
}

#[derive(Debug, Clone)]
struct Record {
    id: i64,
    teacher_code: TeacherCode,
    author: Author,
    /// Display name for student-authored records.
    sender_name: String,
    /// `"all"` or the comma-joined recipient names for teacher-authored
    /// records; the teacher code for student-authored ones.
    recipient: String,
    body: String,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    teachers: HashMap<TeacherCode, String>,
    gates: HashMap<TeacherCode, bool>,
    students: Vec<(TeacherCode, StudentRow)>,
    records: Vec<Record>,
    hidden: HashSet<(i64, String)>,
    next_id: i64,
}

/// In-memory [`MessageStore`]. State lives exactly as long as the process.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<MemoryState>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn append(
        &mut self,
        code: &TeacherCode,
        author: Author,
        sender_name: &str,
        recipient: &str,
        body: &str,
    ) -> (MessageId, DateTime<Utc>) {
        self.next_id += 1;
        let record = Record {
            id: self.next_id,
            teacher_code: code.clone(),
            author,
            sender_name: sender_name.to_string(),
            recipient: recipient.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
        };
        let stamp = (MessageId(record.id), record.timestamp);
        self.records.push(record);
        stamp
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn register_teacher(&self, code: &TeacherCode, name: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .teachers
            .insert(code.clone(), name.to_string());
        Ok(())
    }

    async fn teacher_name(&self, code: &TeacherCode) -> Result<Option<String>> {
        Ok(self.inner.lock().await.teachers.get(code).cloned())
    }

    async fn allow_status(&self, code: &TeacherCode) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .gates
            .get(code)
            .copied()
            .unwrap_or(false))
    }

    async fn set_allow_status(&self, code: &TeacherCode, allow: bool) -> Result<()> {
        self.inner.lock().await.gates.insert(code.clone(), allow);
        Ok(())
    }

    async fn upsert_student(
        &self,
        code: &TeacherCode,
        student_name: &str,
        socket_id: &SocketId,
    ) -> Result<()> {
        let mut state = self.inner.lock().await;
        state
            .students
            .retain(|(row_code, row)| !(row_code == code && row.student_name == student_name));
        state.students.push((
            code.clone(),
            StudentRow {
                student_name: student_name.to_string(),
                socket_id: socket_id.clone(),
            },
        ));
        Ok(())
    }

    async fn student_rows(&self, code: &TeacherCode) -> Result<Vec<StudentRow>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<StudentRow> = state
            .students
            .iter()
            .filter(|(row_code, _)| row_code == code)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| a.student_name.cmp(&b.student_name));
        Ok(rows)
    }

    async fn append_teacher_message(
        &self,
        code: &TeacherCode,
        recipient: &str,
        body: &str,
    ) -> Result<(MessageId, DateTime<Utc>)> {
        let mut state = self.inner.lock().await;
        Ok(state.append(code, Author::Teacher, TEACHER_SENDER_NAME, recipient, body))
    }

    async fn append_student_message(
        &self,
        code: &TeacherCode,
        student_name: &str,
        body: &str,
    ) -> Result<(MessageId, DateTime<Utc>)> {
        let mut state = self.inner.lock().await;
        let recipient = code.as_str().to_string();
        let stamp = state.append(code, Author::Student, student_name, &recipient, body);

        // Keep only the newest TEACHER_INBOX_CAP student records per teacher.
        let inbox_ids: Vec<i64> = state
            .records
            .iter()
            .filter(|record| record.author == Author::Student && &record.teacher_code == code)
            .map(|record| record.id)
            .collect();
        if inbox_ids.len() > TEACHER_INBOX_CAP {
            let cutoff = inbox_ids[inbox_ids.len() - TEACHER_INBOX_CAP];
            state.records.retain(|record| {
                !(record.author == Author::Student
                    && &record.teacher_code == code
                    && record.id < cutoff)
            });
        }
        Ok(stamp)
    }

    async fn history_for_student(
        &self,
        code: &TeacherCode,
        student_name: &str,
    ) -> Result<Vec<HistoryMessage>> {
        let state = self.inner.lock().await;
        let key = student_key(code, student_name);
        let mut visible: Vec<&Record> = state
            .records
            .iter()
            .filter(|record| {
                record.author == Author::Teacher
                    && &record.teacher_code == code
                    && (record.recipient == "all" || record.recipient.contains(student_name))
                    && !state.hidden.contains(&(record.id, key.clone()))
            })
            .collect();
        visible.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        visible.truncate(STUDENT_HISTORY_LIMIT);
        Ok(visible
            .into_iter()
            .map(|record| HistoryMessage {
                id: MessageId(record.id),
                sender: record.sender_name.clone(),
                message: record.body.clone(),
                timestamp: record.timestamp,
            })
            .collect())
    }

    async fn hide_for_student(
        &self,
        message_id: MessageId,
        code: &TeacherCode,
        student_name: &str,
    ) -> Result<()> {
        let key = student_key(code, student_name);
        self.inner
            .lock()
            .await
            .hidden
            .insert((message_id.0, key));
        Ok(())
    }

    async fn delete_teacher_message(
        &self,
        message_id: MessageId,
        code: &TeacherCode,
    ) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let owned = state
            .records
            .iter()
            .any(|record| record.id == message_id.0 && &record.teacher_code == code);
        if !owned {
            return Ok(false);
        }
        state.records.retain(|record| record.id != message_id.0);
        state.hidden.retain(|(id, _)| *id != message_id.0);
        Ok(true)
    }

    async fn teacher_inbox(&self, code: &TeacherCode) -> Result<Vec<InboundStudentMessage>> {
        let state = self.inner.lock().await;
        let mut inbox: Vec<&Record> = state
            .records
            .iter()
            .filter(|record| record.author == Author::Student && &record.teacher_code == code)
            .collect();
        inbox.sort_by(|a, b| b.id.cmp(&a.id));
        inbox.truncate(TEACHER_HISTORY_LIMIT);
        Ok(inbox
            .into_iter()
            .map(|record| InboundStudentMessage {
                id: MessageId(record.id),
                student_name: record.sender_name.clone(),
                message: record.body.clone(),
                timestamp: record.timestamp,
            })
            .collect())
    }

    async fn sent_messages(&self, code: &TeacherCode) -> Result<Vec<SentMessageRecord>> {
        let state = self.inner.lock().await;
        let mut sent: Vec<&Record> = state
            .records
            .iter()
            .filter(|record| record.author == Author::Teacher && &record.teacher_code == code)
            .collect();
        sent.sort_by(|a, b| b.id.cmp(&a.id));
        sent.truncate(TEACHER_HISTORY_LIMIT);
        Ok(sent
            .into_iter()
            .map(|record| SentMessageRecord {
                id: MessageId(record.id),
                recipient: record.recipient.clone(),
                message: record.body.clone(),
                timestamp: record.timestamp,
            })
            .collect())
    }
}
