use shared::domain::{RosterEntry, SocketId, StudentInfo};

/// The teacher-visible set of connected students. Socket id is the primary
/// key; a reconnect under the same display name evicts the stale entry before
/// the new one is inserted, so ghosts never accumulate.
#[derive(Debug, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_online).count()
    }

    pub fn get(&self, socket_id: &SocketId) -> Option<&RosterEntry> {
        self.entries.iter().find(|entry| &entry.socket_id == socket_id)
    }

    pub fn online_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.is_online)
            .map(|entry| entry.student_name.clone())
            .collect()
    }

    /// Incremental `student_connected`. Same-name entries are evicted first.
    pub fn apply_connected(&mut self, student: &StudentInfo) {
        self.entries
            .retain(|entry| entry.student_name != student.student_name);
        self.entries.push(RosterEntry {
            socket_id: student.socket_id.clone(),
            student_name: student.student_name.clone(),
            is_online: true,
        });
        self.sort();
    }

    /// Incremental `student_disconnected`. Returns whether an entry was
    /// removed.
    pub fn apply_disconnected(&mut self, socket_id: &SocketId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.socket_id != socket_id);
        self.entries.len() != before
    }

    /// Authoritative `student_list_update`: the whole roster is replaced.
    pub fn replace_all(&mut self, entries: Vec<RosterEntry>) {
        self.entries = entries;
        self.sort();
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.student_name.cmp(&b.student_name));
    }
}
