use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(MessageId);

/// Server-assigned per-connection identifier (uuid text on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketId(pub String);

impl SocketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("teacher code must be exactly 6 digits")]
pub struct TeacherCodeError;

/// A teacher's 6-digit join code. Validated at construction; the wire and the
/// store only ever carry well-formed values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TeacherCode(String);

impl TeacherCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TeacherCode {
    type Err = TeacherCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(TeacherCodeError)
        }
    }
}

impl TryFrom<String> for TeacherCode {
    type Error = TeacherCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TeacherCode> for String {
    fn from(value: TeacherCode) -> Self {
        value.0
    }
}

impl fmt::Display for TeacherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    Error,
}

/// Join echo / roster-change payload for one student connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentInfo {
    pub teacher_code: TeacherCode,
    pub student_name: String,
    pub socket_id: SocketId,
    pub teacher_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub socket_id: SocketId,
    pub student_name: String,
    pub is_online: bool,
}

const ALL_SENTINEL: &str = "all";

/// Outbound addressing: either every online student in the room, or an
/// explicit socket-id list. Serialized as `["all"]` or the literal id list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientSet {
    All,
    Students(Vec<SocketId>),
}

impl Serialize for RecipientSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            RecipientSet::All => [ALL_SENTINEL].serialize(serializer),
            RecipientSet::Students(ids) => ids.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RecipientSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        if raw.iter().any(|entry| entry == ALL_SENTINEL) {
            Ok(RecipientSet::All)
        } else {
            Ok(RecipientSet::Students(
                raw.into_iter().map(SocketId).collect(),
            ))
        }
    }
}
