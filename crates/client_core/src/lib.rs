use std::time::Duration;

pub mod cache;
pub mod durable;
pub mod error;
pub mod notify;
pub mod permission;
pub mod read;
pub mod recipients;
pub mod roster;
pub mod schedule;
pub mod session;
pub mod student;
pub mod teacher;
pub mod transport;

pub use cache::{CachedMessage, Direction, HistoryMode, IncomingMessage, MessageCache, MessageKey};
pub use durable::{MemoryStateStore, MessageLog, SqliteStateStore, StateStore, StoredIdentity};
pub use error::ClientError;
pub use notify::{Notifier, NullNotifier, Surface};
pub use recipients::Selection;
pub use session::{ConnectionState, StudentIdentity, TeacherIdentity};
pub use student::{JoinAck, StudentClient};
pub use teacher::{SentEntry, TeacherClient};
pub use transport::{Transport, TransportConnector, TransportEvent, WsConnector, WsTransport};

/// The teacher's sent log keeps this many entries, newest first.
pub const SENT_LOG_CAP: usize = 200;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `Replace` is the default: it is the only policy that mirrors
    /// server-side hides/deletes without a separate reconciliation pass.
    /// `Merge` matches the older relay variant.
    pub history_mode: HistoryMode,
    /// Foreground live messages auto-read after this delay.
    pub auto_read_delay: Duration,
    /// Background→foreground mark-all-read waits this long first.
    pub visibility_sweep_debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            history_mode: HistoryMode::Replace,
            auto_read_delay: Duration::from_secs(2),
            visibility_sweep_debounce: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// What the (out-of-scope) UI layer observes. Store snapshots are pulled via
/// the client accessors; these events say when to pull.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    MessagesUpdated,
    UnreadChanged(usize),
    PermissionChanged(bool),
    RosterUpdated,
    InboxUpdated,
    SentLogUpdated,
    Kicked,
    Notice { level: NoticeLevel, text: String },
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
