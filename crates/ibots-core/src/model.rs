//! Transient views of platform data.
//!
//! Entries and users are owned by the remote platform. The runtime only keeps
//! short-lived copies of them while dispatching.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::bid::{Bid, EntryKind, UserKind};

// =============================================================================
// Scalars
// =============================================================================

/// Milliseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The starting point of every fresh checkpoint.
    pub const EPOCH: Self = Self(0);

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Converts from a `time` datetime, truncating to milliseconds.
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        Self((dt.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    /// Parses an RFC 3339 string as sent by the platform.
    pub fn parse_rfc3339(s: &str) -> Result<Self, time::error::Parse> {
        OffsetDateTime::parse(s, &Rfc3339).map(Self::from_datetime)
    }

    /// Formats as RFC 3339, or `None` if out of the representable range.
    pub fn to_rfc3339(&self) -> Option<String> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000)
            .ok()
            .and_then(|dt| dt.format(&Rfc3339).ok())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Some(s) => f.write_str(&s),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// An amount of US cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Kind-specific content of an [`Entry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    Donation {
        target: Bid,
        amount: Cents,
        #[serde(default)]
        description: String,
    },
    Transaction {
        target: Bid,
        amount: Cents,
        #[serde(default)]
        description: String,
    },
    News {
        title: String,
        #[serde(default)]
        description: String,
    },
    Event {
        title: String,
        #[serde(default)]
        description: String,
        date: Timestamp,
        /// Length in minutes.
        duration: u32,
        #[serde(default)]
        address: String,
        #[serde(default)]
        rsvps: Vec<Bid>,
    },
    Post {
        title: String,
        #[serde(default)]
        description: String,
    },
    Comment {
        /// The entry or user being commented on.
        parent: Bid,
        description: String,
    },
}

impl EntryPayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Donation { .. } => EntryKind::Donation,
            Self::Transaction { .. } => EntryKind::Transaction,
            Self::News { .. } => EntryKind::News,
            Self::Event { .. } => EntryKind::Event,
            Self::Post { .. } => EntryKind::Post,
            Self::Comment { .. } => EntryKind::Comment,
        }
    }

    /// Recipient and amount of a monetary entry.
    pub fn transfer(&self) -> Option<(&Bid, Cents)> {
        match self {
            Self::Donation { target, amount, .. } | Self::Transaction { target, amount, .. } => {
                Some((target, *amount))
            }
            _ => None,
        }
    }

    /// Free text of the entry.
    pub fn text(&self) -> &str {
        match self {
            Self::Donation { description, .. }
            | Self::Transaction { description, .. }
            | Self::News { description, .. }
            | Self::Event { description, .. }
            | Self::Post { description, .. }
            | Self::Comment { description, .. } => description,
        }
    }
}

/// Any content or financial unit on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub bid: Bid,
    pub created: Timestamp,
    pub author: Bid,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        self.payload.kind()
    }

    /// The dispatch ordering key.
    pub fn ordering_key(&self) -> (Timestamp, &Bid) {
        (self.created, &self.bid)
    }

    /// The parent BID, for comments.
    pub fn parent(&self) -> Option<&Bid> {
        match &self.payload {
            EntryPayload::Comment { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// Whether the BID kind agrees with the payload and the author is a user.
    pub fn is_well_formed(&self) -> bool {
        self.bid.kind().entry_kind() == Some(self.kind()) && self.author.is_user()
    }
}

// =============================================================================
// Users
// =============================================================================

/// A nonprofit or a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub bid: Bid,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub balance: Cents,
}

impl User {
    pub fn kind(&self) -> Option<UserKind> {
        self.bid.kind().user_kind()
    }

    /// First word of the full name, falling back to the username.
    pub fn short_name(&self) -> &str {
        self.full_name
            .split_whitespace()
            .next()
            .unwrap_or(&self.username)
    }
}

/// Login credentials of one bot.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_parses_platform_format() {
        let ts = Timestamp::parse_rfc3339("1970-01-01T00:00:10.250Z").unwrap();
        assert_eq!(ts.as_millis(), 10_250);
        let offset = Timestamp::parse_rfc3339("1970-01-01T01:00:10.250+01:00").unwrap();
        assert_eq!(offset, ts);
    }

    #[test]
    fn test_cents_display() {
        assert_eq!(Cents(1234).to_string(), "$12.34");
        assert_eq!(Cents(5).to_string(), "$0.05");
        assert_eq!(Cents(-250).to_string(), "-$2.50");
    }

    #[test]
    fn test_entry_well_formed() {
        let entry = Entry {
            bid: Bid::entry(EntryKind::Post, "p1"),
            created: Timestamp::from_millis(10),
            author: Bid::user(UserKind::Person, "u1"),
            payload: EntryPayload::Post {
                title: "hi".into(),
                description: String::new(),
            },
        };
        assert!(entry.is_well_formed());

        let mismatched = Entry {
            bid: Bid::entry(EntryKind::Comment, "p1"),
            ..entry
        };
        assert!(!mismatched.is_well_formed());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("hello", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
