use shared::domain::{RecipientSet, SocketId};

use crate::{error::ClientError, roster::Roster};

/// UI-level addressing choice, resolved against the live roster at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Subset(Vec<SocketId>),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipients {
    pub wire: RecipientSet,
    /// Display names captured now; the send ack carries only status and id,
    /// so these label the sent-log entry later.
    pub display_names: Vec<String>,
    pub is_all: bool,
}

/// Turns a selection into wire recipients. Ids that went offline between
/// selection and send are silently dropped; an empty result (and `None`)
/// fails validation before anything is transmitted.
pub fn resolve(roster: &Roster, selection: &Selection) -> Result<ResolvedRecipients, ClientError> {
    match selection {
        Selection::None => Err(ClientError::validation("no recipients selected")),
        Selection::All => Ok(ResolvedRecipients {
            wire: RecipientSet::All,
            display_names: roster.online_names(),
            is_all: true,
        }),
        Selection::Subset(ids) => {
            let mut wire_ids = Vec::new();
            let mut display_names = Vec::new();
            for id in ids {
                if let Some(entry) = roster.get(id) {
                    if entry.is_online {
                        wire_ids.push(id.clone());
                        display_names.push(entry.student_name.clone());
                    }
                }
            }
            if wire_ids.is_empty() {
                return Err(ClientError::validation(
                    "none of the selected recipients are online",
                ));
            }
            Ok(ResolvedRecipients {
                wire: RecipientSet::Students(wire_ids),
                display_names,
                is_all: false,
            })
        }
    }
}

/// Human-readable recipient label: the name alone for a single recipient,
/// `"<first> 외 N명"` for several, `"전체 학생"` for the bare all sentinel.
pub fn format_recipient_label(names: &[String], is_all: bool) -> String {
    match names {
        [] if is_all => "전체 학생".to_string(),
        [] => "수신자 없음".to_string(),
        [only] => only.clone(),
        [first, rest @ ..] => format!("{first} 외 {}명", rest.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{RosterEntry, StudentInfo};

    fn roster_with(entries: &[(&str, &str, bool)]) -> Roster {
        let mut roster = Roster::default();
        roster.replace_all(
            entries
                .iter()
                .map(|(name, socket, online)| RosterEntry {
                    socket_id: SocketId(socket.to_string()),
                    student_name: name.to_string(),
                    is_online: *online,
                })
                .collect(),
        );
        roster
    }

    #[test]
    fn all_resolves_to_the_sentinel_with_online_names() {
        let roster = roster_with(&[("Kim", "s-1", true), ("Park", "s-2", false)]);
        let resolved = resolve(&roster, &Selection::All).expect("resolve");
        assert_eq!(resolved.wire, RecipientSet::All);
        assert_eq!(resolved.display_names, ["Kim"]);
        assert!(resolved.is_all);
    }

    #[test]
    fn subset_silently_drops_offline_ids() {
        let roster = roster_with(&[("Kim", "s-1", true), ("Park", "s-2", false)]);
        let selection = Selection::Subset(vec![SocketId("s-1".into()), SocketId("s-2".into())]);
        let resolved = resolve(&roster, &selection).expect("resolve");
        assert_eq!(
            resolved.wire,
            RecipientSet::Students(vec![SocketId("s-1".into())])
        );
        assert_eq!(resolved.display_names, ["Kim"]);
    }

    #[test]
    fn fully_offline_subset_fails_validation() {
        let roster = roster_with(&[("Park", "s-2", false)]);
        let selection = Selection::Subset(vec![SocketId("s-2".into())]);
        let err = resolve(&roster, &selection).expect_err("must fail");
        assert!(err.is_validation());
    }

    #[test]
    fn empty_selection_always_fails_validation() {
        let populated = roster_with(&[("Kim", "s-1", true)]);
        assert!(resolve(&populated, &Selection::None)
            .expect_err("must fail")
            .is_validation());

        let empty = Roster::default();
        assert!(resolve(&empty, &Selection::None)
            .expect_err("must fail")
            .is_validation());
    }

    #[test]
    fn all_with_an_empty_roster_is_still_sendable() {
        let roster = Roster::default();
        let resolved = resolve(&roster, &Selection::All).expect("resolve");
        assert_eq!(resolved.wire, RecipientSet::All);
        assert!(resolved.display_names.is_empty());
    }

    #[test]
    fn labels_follow_the_recipient_count() {
        assert_eq!(format_recipient_label(&[], true), "전체 학생");
        assert_eq!(format_recipient_label(&["Kim".into()], false), "Kim");
        assert_eq!(
            format_recipient_label(&["Kim".into(), "Park".into(), "Choi".into()], false),
            "Kim 외 2명"
        );
        assert_eq!(
            format_recipient_label(&["Kim".into(), "Park".into()], true),
            "Kim 외 1명"
        );
        assert_eq!(format_recipient_label(&[], false), "수신자 없음");
    }
}
