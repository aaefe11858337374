//! Basic identifiers (BIDs).
//!
//! Every user and entry on the platform is addressed through a [`Bid`]: a
//! tagged identifier made of a [`BidKind`] and the platform's opaque id. Bot
//! logic can therefore key maps, checkpoints and idempotence records on a
//! single type regardless of what the identifier points at.
//!
//! BIDs order by id first and kind second. The history tracker relies on this
//! order to break timestamp ties, so it must stay stable across releases.
//!
//! The canonical text form is `<tag>:<id>` (for example `post:4711`), which is
//! also how BIDs are serialized inside checkpoints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownKindError;

/// The two kinds of users on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    /// A registered charity. Receives donations, publishes news and events.
    Nonprofit,
    /// A human or an ibot. Receives transactions, publishes posts.
    Person,
}

/// Kinds of content and financial units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Donation,
    Transaction,
    News,
    Event,
    Post,
    Comment,
}

impl EntryKind {
    /// All entry kinds, in declaration order.
    pub const ALL: [EntryKind; 6] = [
        Self::Donation,
        Self::Transaction,
        Self::News,
        Self::Event,
        Self::Post,
        Self::Comment,
    ];

    /// Returns the lowercase tag used in BIDs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donation => "donation",
            Self::Transaction => "transaction",
            Self::News => "news",
            Self::Event => "event",
            Self::Post => "post",
            Self::Comment => "comment",
        }
    }

    /// Whether entries of this kind move money.
    pub fn is_monetary(&self) -> bool {
        matches!(self, Self::Donation | Self::Transaction)
    }
}

impl UserKind {
    /// Returns the lowercase tag used in BIDs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nonprofit => "nonprofit",
            Self::Person => "person",
        }
    }

    /// Whether a user of this kind may create entries of `kind`.
    pub fn can_author(&self, kind: EntryKind) -> bool {
        match self {
            Self::Nonprofit => matches!(
                kind,
                EntryKind::News | EntryKind::Event | EntryKind::Comment
            ),
            Self::Person => matches!(
                kind,
                EntryKind::Donation | EntryKind::Transaction | EntryKind::Post | EntryKind::Comment
            ),
        }
    }

    /// Whether a user of this kind may be the target of a monetary entry of `kind`.
    pub fn can_receive(&self, kind: EntryKind) -> bool {
        matches!(
            (self, kind),
            (Self::Nonprofit, EntryKind::Donation) | (Self::Person, EntryKind::Transaction)
        )
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind half of a [`Bid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidKind {
    User(UserKind),
    Entry(EntryKind),
}

impl BidKind {
    /// Returns the lowercase tag used in the canonical text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User(kind) => kind.as_str(),
            Self::Entry(kind) => kind.as_str(),
        }
    }

    /// Returns the entry kind, if this is an entry.
    pub fn entry_kind(&self) -> Option<EntryKind> {
        match self {
            Self::Entry(kind) => Some(*kind),
            Self::User(_) => None,
        }
    }

    /// Returns the user kind, if this is a user.
    pub fn user_kind(&self) -> Option<UserKind> {
        match self {
            Self::User(kind) => Some(*kind),
            Self::Entry(_) => None,
        }
    }
}

impl fmt::Display for BidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A basic identifier for a user or an entry.
///
/// Field order matters: the derived `Ord` compares `id` before `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Bid {
    id: String,
    kind: BidKind,
}

impl Bid {
    /// Creates a BID from an already-resolved kind.
    pub fn new(kind: BidKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Shorthand for a user BID.
    pub fn user(kind: UserKind, id: impl Into<String>) -> Self {
        Self::new(BidKind::User(kind), id)
    }

    /// Shorthand for an entry BID.
    pub fn entry(kind: EntryKind, id: impl Into<String>) -> Self {
        Self::new(BidKind::Entry(kind), id)
    }

    /// The platform's opaque identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The kind of entity this BID points at.
    pub fn kind(&self) -> BidKind {
        self.kind
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, BidKind::User(_))
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.kind, BidKind::Entry(_))
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl From<Bid> for String {
    fn from(bid: Bid) -> Self {
        bid.to_string()
    }
}

impl FromStr for Bid {
    type Err = UnknownKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, id) = s.split_once(':').ok_or_else(|| UnknownKindError::new(s))?;
        BidRegistry.resolve(id, tag)
    }
}

impl TryFrom<String> for Bid {
    type Error = UnknownKindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Platform kind tags accepted by [`BidRegistry::resolve`].
///
/// Aliases cover the names the platform uses in its GraphQL schema.
const KIND_TAGS: &[(&str, BidKind)] = &[
    ("nonprofit", BidKind::User(UserKind::Nonprofit)),
    ("organization", BidKind::User(UserKind::Nonprofit)),
    ("person", BidKind::User(UserKind::Person)),
    ("bot", BidKind::User(UserKind::Person)),
    ("donation", BidKind::Entry(EntryKind::Donation)),
    ("transaction", BidKind::Entry(EntryKind::Transaction)),
    ("reward", BidKind::Entry(EntryKind::Transaction)),
    ("news", BidKind::Entry(EntryKind::News)),
    ("event", BidKind::Entry(EntryKind::Event)),
    ("post", BidKind::Entry(EntryKind::Post)),
    ("comment", BidKind::Entry(EntryKind::Comment)),
];

/// Resolves raw platform identifiers into [`Bid`]s.
///
/// The registry holds no state beyond the static kind-tag table, so resolving
/// the same input always yields the same BID, across processes and restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BidRegistry;

impl BidRegistry {
    /// Looks up the kind for a platform tag such as `"Post"` or `"DonationNode"`.
    ///
    /// Matching is case-insensitive and ignores a trailing `Node` suffix.
    pub fn kind_for_tag(&self, tag: &str) -> Result<BidKind, UnknownKindError> {
        let normalized = tag.trim().to_ascii_lowercase();
        let normalized = normalized.strip_suffix("node").unwrap_or(&normalized);

        KIND_TAGS
            .iter()
            .find(|(name, _)| *name == normalized)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| UnknownKindError::new(tag))
    }

    /// Resolves a raw platform id reported under `kind_tag`.
    pub fn resolve(&self, raw_id: &str, kind_tag: &str) -> Result<Bid, UnknownKindError> {
        let kind = self.kind_for_tag(kind_tag)?;
        Ok(Bid::new(kind, raw_id))
    }

    /// Returns the kind of a resolved BID.
    pub fn kind_of(&self, bid: &Bid) -> BidKind {
        bid.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_accepts_aliases_and_node_suffix() {
        let registry = BidRegistry;
        let bid = registry.resolve("42", "DonationNode").unwrap();
        assert_eq!(bid.kind(), BidKind::Entry(EntryKind::Donation));
        assert_eq!(
            registry.resolve("7", "Organization").unwrap().kind(),
            BidKind::User(UserKind::Nonprofit)
        );
        assert_eq!(
            registry.kind_of(&registry.resolve("9", "reward").unwrap()),
            BidKind::Entry(EntryKind::Transaction)
        );
    }

    #[test]
    fn test_resolve_unknown_kind() {
        let err = BidRegistry.resolve("1", "Poll").unwrap_err();
        assert_eq!(err.tag, "Poll");
    }

    #[test]
    fn test_ordering_is_by_id_then_kind() {
        let a = Bid::entry(EntryKind::Post, "a");
        let b = Bid::entry(EntryKind::Post, "b");
        let a_comment = Bid::entry(EntryKind::Comment, "a");
        let mut bids = vec![b.clone(), a.clone(), a_comment.clone()];
        bids.sort();
        assert_eq!(bids, vec![a, a_comment, b]);
    }

    #[test]
    fn test_text_form_survives_serde() {
        let bid = Bid::entry(EntryKind::Comment, "abc:def");
        let json = serde_json::to_string(&bid).unwrap();
        assert_eq!(json, "\"comment:abc:def\"");
        let back: Bid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bid);
    }

    #[test]
    fn test_authoring_rules() {
        assert!(UserKind::Nonprofit.can_author(EntryKind::News));
        assert!(!UserKind::Nonprofit.can_author(EntryKind::Post));
        assert!(!UserKind::Person.can_author(EntryKind::Event));
        assert!(UserKind::Person.can_author(EntryKind::Donation));
        assert!(UserKind::Nonprofit.can_receive(EntryKind::Donation));
        assert!(!UserKind::Person.can_receive(EntryKind::Donation));
        assert!(UserKind::Person.can_receive(EntryKind::Transaction));
    }
}
