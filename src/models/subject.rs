use std::fmt;

use serde::{Deserialize, Serialize};

/// The category of billable principal.
///
/// Stored as a string column so that adding a new subject type (e.g. an
/// organization) requires no schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Token,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Token => "token",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(SubjectType::User),
            "token" => Some(SubjectType::Token),
            _ => None,
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The billable principal: a tagged `(type, id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    User(i64),
    Token(i64),
}

impl Subject {
    pub fn new(subject_type: SubjectType, id: i64) -> Self {
        match subject_type {
            SubjectType::User => Subject::User(id),
            SubjectType::Token => Subject::Token(id),
        }
    }

    pub fn subject_type(&self) -> SubjectType {
        match self {
            Subject::User(_) => SubjectType::User,
            Subject::Token(_) => SubjectType::Token,
        }
    }

    pub fn type_str(&self) -> &'static str {
        self.subject_type().as_str()
    }

    pub fn id(&self) -> i64 {
        match self {
            Subject::User(id) | Subject::Token(id) => *id,
        }
    }

    /// Reconstruct a subject from stored columns.
    pub fn from_parts(type_str: &str, id: i64) -> Option<Self> {
        SubjectType::parse(type_str).map(|t| Subject::new(t, id))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_str(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_parts() {
        let subject = Subject::Token(99);
        let rebuilt = Subject::from_parts(subject.type_str(), subject.id());
        assert_eq!(rebuilt, Some(subject));
        assert_eq!(Subject::from_parts("organization", 1), None);
    }

    #[test]
    fn serde_uses_tagged_form() {
        let json = serde_json::to_string(&Subject::User(7)).unwrap();
        assert_eq!(json, r#"{"type":"user","id":7}"#);
    }
}
