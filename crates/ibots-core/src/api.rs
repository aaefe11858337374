//! Platform API abstraction and the retry policy around it.
//!
//! Transports implement [`PlatformApi`], which makes exactly one attempt per
//! call. Bots never talk to a transport directly. They go through
//! [`ApiClient`], which:
//!
//! - retries reads with bounded exponential backoff,
//! - never retries writes (a donation submitted twice is money spent twice),
//! - validates mutations locally before anything reaches the network,
//! - drops malformed entries instead of failing the whole fetch.
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌──────────────────┐
//! │ Bot handler  │──▶│ ApiClient (policy) │──▶│ PlatformApi impl │──▶ network
//! └──────────────┘   └────────────────────┘   └──────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bid::{Bid, EntryKind, UserKind};
use crate::error::{ApiError, ApiResult};
use crate::model::{Cents, Credentials, Entry, Timestamp, User};

/// Page size for helpers that read a whole listing.
const PAGE_SIZE: usize = 100;

/// Comment chains deeper than this are treated as cyclic.
const MAX_CHAIN_DEPTH: usize = 1_000;

// =============================================================================
// Requests
// =============================================================================

/// Cursor-based entry query. Returns entries created at or after `since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryQuery {
    pub since: Timestamp,
    /// Kinds to include. Empty means every kind.
    #[serde(default)]
    pub kinds: Vec<EntryKind>,
    /// Maximum number of entries, oldest first.
    pub limit: usize,
    /// Entries authored by this user, or received by it for donations and
    /// transactions.
    #[serde(default)]
    pub by_user: Option<Bid>,
    /// Comments replying to this entry or user.
    #[serde(default)]
    pub parent: Option<Bid>,
    /// Donations and transactions sent to this user.
    #[serde(default)]
    pub target: Option<Bid>,
}

impl EntryQuery {
    pub fn since(since: Timestamp) -> Self {
        Self {
            since,
            kinds: Vec::new(),
            limit: 25,
            by_user: None,
            parent: None,
            target: None,
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EntryKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn by_user(mut self, user: Bid) -> Self {
        self.by_user = Some(user);
        self
    }

    pub fn parent(mut self, parent: Bid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn target(mut self, target: Bid) -> Self {
        self.target = Some(target);
        self
    }

    /// The kinds that can satisfy every filter of the query.
    pub fn candidate_kinds(&self) -> Vec<EntryKind> {
        EntryKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.kinds.is_empty() || self.kinds.contains(kind))
            .filter(|kind| self.parent.is_none() || *kind == EntryKind::Comment)
            .filter(|kind| {
                self.target.is_none() || matches!(kind, EntryKind::Donation | EntryKind::Transaction)
            })
            .collect()
    }

    /// Whether `entry` satisfies the query's cursor and filters.
    pub fn matches(&self, entry: &Entry) -> bool {
        let target = entry.payload.transfer().map(|(target, _)| target);
        entry.created >= self.since
            && (self.kinds.is_empty() || self.kinds.contains(&entry.kind()))
            && self
                .by_user
                .as_ref()
                .is_none_or(|user| &entry.author == user || target == Some(user))
            && self.parent.as_ref().is_none_or(|p| entry.parent() == Some(p))
            && self.target.as_ref().is_none_or(|t| target == Some(t))
    }
}

/// One fetched page, after malformed entries were dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    /// Entries the platform returned, including dropped ones.
    pub fetched: usize,
}

impl From<Vec<Entry>> for EntryPage {
    fn from(entries: Vec<Entry>) -> Self {
        Self {
            fetched: entries.len(),
            entries,
        }
    }
}

/// A comment and every reply below it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    pub comment: Entry,
    pub replies: Vec<CommentThread>,
}

/// User listing query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuery {
    pub kind: Option<UserKind>,
    /// Substring of the username or full name.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl UserQuery {
    pub fn kind(mut self, kind: UserKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }
}

/// A new entry to create on behalf of the authenticated bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Post {
        title: String,
        description: String,
    },
    Comment {
        parent: Bid,
        description: String,
    },
    Donation {
        target: Bid,
        amount: Cents,
        description: String,
    },
    Transaction {
        target: Bid,
        amount: Cents,
        description: String,
    },
    News {
        title: String,
        description: String,
    },
    Event {
        title: String,
        description: String,
        date: Timestamp,
        duration: u32,
        address: String,
    },
}

impl Mutation {
    /// The kind of entry this mutation creates.
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Post { .. } => EntryKind::Post,
            Self::Comment { .. } => EntryKind::Comment,
            Self::Donation { .. } => EntryKind::Donation,
            Self::Transaction { .. } => EntryKind::Transaction,
            Self::News { .. } => EntryKind::News,
            Self::Event { .. } => EntryKind::Event,
        }
    }

    /// Checks the authoring and receiving rules for an author of kind `author`.
    pub fn validate(&self, author: UserKind) -> ApiResult<()> {
        let kind = self.kind();
        if !author.can_author(kind) {
            return Err(ApiError::InvalidMutation(format!(
                "a {author} cannot create a {kind}"
            )));
        }

        match self {
            Self::Donation { target, amount, .. } | Self::Transaction { target, amount, .. } => {
                if amount.0 <= 0 {
                    return Err(ApiError::InvalidMutation(format!(
                        "{kind} amount must be positive, got {amount}"
                    )));
                }
                let receives = target
                    .kind()
                    .user_kind()
                    .is_some_and(|target_kind| target_kind.can_receive(kind));
                if !receives {
                    return Err(ApiError::InvalidMutation(format!(
                        "{target} cannot receive a {kind}"
                    )));
                }
            }
            Self::Comment { description, .. } if description.trim().is_empty() => {
                return Err(ApiError::InvalidMutation("comment text is empty".into()));
            }
            _ => {}
        }

        Ok(())
    }
}

/// Boolean relations between a user and another BID.
///
/// Relations are queried on demand and are not part of the deduplicated
/// event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// User likes an entry.
    Like,
    /// User attends an event.
    Rsvp,
    /// User follows another user.
    Follow,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Rsvp => "rsvp",
            Self::Follow => "follow",
        }
    }

    /// Whether `target` is a valid object for this relation.
    pub fn accepts(&self, target: &Bid) -> bool {
        match self {
            Self::Like => target.is_entry(),
            Self::Rsvp => target.kind().entry_kind() == Some(EntryKind::Event),
            Self::Follow => target.is_user(),
        }
    }
}

// =============================================================================
// Transport Traits
// =============================================================================

/// A logged-in session against the platform.
///
/// Every method makes a single attempt. Network-level failures are reported
/// as [`ApiError::Transient`]; retry policy lives in [`ApiClient`].
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// The authenticated user.
    fn identity(&self) -> &Bid;

    async fn fetch_entries(&self, query: &EntryQuery) -> ApiResult<Vec<Entry>>;

    async fn fetch_entry(&self, bid: &Bid) -> ApiResult<Option<Entry>>;

    async fn fetch_users(&self, query: &UserQuery) -> ApiResult<Vec<User>>;

    async fn fetch_user(&self, bid: &Bid) -> ApiResult<Option<User>>;

    /// Creates an entry and returns its BID.
    async fn mutate(&self, mutation: &Mutation) -> ApiResult<Bid>;

    /// Lists the users holding `kind` towards `target`.
    async fn fetch_relation(&self, kind: RelationKind, target: &Bid) -> ApiResult<Vec<Bid>>;

    /// Sets or clears the authenticated user's `kind` relation towards `target`.
    async fn set_relation(&self, kind: RelationKind, target: &Bid, active: bool) -> ApiResult<()>;
}

/// Opens [`PlatformApi`] sessions from bot credentials.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Logs in. Rejected credentials yield [`ApiError::Unauthorized`].
    async fn connect(&self, credentials: &Credentials) -> ApiResult<Arc<dyn PlatformApi>>;
}

/// A shared connector trait object.
pub type BoxedConnector = Arc<dyn PlatformConnector>;

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

// =============================================================================
// ApiClient
// =============================================================================

/// The API handle given to bots.
///
/// Cheap to clone; clones share the underlying session.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<dyn PlatformApi>,
    retry: RetryConfig,
}

impl ApiClient {
    /// Wraps an existing session.
    pub fn new(inner: Arc<dyn PlatformApi>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    /// Logs in through `connector`, retrying transient failures with `retry`.
    ///
    /// Logging in has no side effects, so it follows the read policy.
    pub async fn connect(
        connector: &dyn PlatformConnector,
        credentials: &Credentials,
        retry: RetryConfig,
    ) -> ApiResult<Self> {
        let session = with_retry(&retry, "connect", move || connector.connect(credentials)).await?;
        info!(
            username = %credentials.username,
            identity = %session.identity(),
            "Connected to platform"
        );
        Ok(Self::new(session, retry))
    }

    /// The authenticated user's BID.
    pub fn identity(&self) -> &Bid {
        self.inner.identity()
    }

    /// Returns the read retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    // -------------------------------------------------------------------------
    // Reads (retried)
    // -------------------------------------------------------------------------

    /// Fetches one page of entries.
    ///
    /// Malformed entries and entries outside the query are dropped and logged.
    /// [`EntryPage::fetched`] still counts them.
    pub async fn fetch_page(&self, query: &EntryQuery) -> ApiResult<EntryPage> {
        let inner = &self.inner;
        let raw = with_retry(&self.retry, "fetch_entries", move || {
            inner.fetch_entries(query)
        })
        .await?;

        let fetched = raw.len();
        let entries: Vec<Entry> = raw
            .into_iter()
            .filter(|entry| {
                if !entry.is_well_formed() {
                    warn!(bid = %entry.bid, kind = %entry.kind(), "Skipping malformed entry");
                    return false;
                }
                if !query.matches(entry) {
                    debug!(bid = %entry.bid, created = %entry.created, "Skipping entry outside query");
                    return false;
                }
                true
            })
            .collect();

        debug!(
            since = %query.since,
            fetched,
            kept = entries.len(),
            "Fetched entries"
        );
        Ok(EntryPage { entries, fetched })
    }

    pub async fn fetch_entries(&self, query: &EntryQuery) -> ApiResult<Vec<Entry>> {
        Ok(self.fetch_page(query).await?.entries)
    }

    /// Every entry matching `query` from `query.since` on, paging as needed.
    ///
    /// A full page that adds nothing new is retried with twice the limit.
    pub async fn fetch_all(&self, query: &EntryQuery) -> ApiResult<Vec<Entry>> {
        let mut query = query.clone();
        query.limit = query.limit.max(1);
        let mut seen = HashSet::new();
        let mut all = Vec::new();

        loop {
            let page = self.fetch_page(&query).await?;
            let full = page.fetched >= query.limit;
            let mut added = false;
            for entry in page.entries {
                if seen.insert(entry.bid.clone()) {
                    query.since = query.since.max(entry.created);
                    all.push(entry);
                    added = true;
                }
            }
            if !full {
                break;
            }
            if !added {
                query.limit = query.limit.saturating_mul(2);
            }
        }

        all.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        Ok(all)
    }

    /// A single entry by BID. Malformed entries read as missing.
    pub async fn fetch_entry(&self, bid: &Bid) -> ApiResult<Option<Entry>> {
        if !bid.is_entry() {
            return Ok(None);
        }
        let inner = &self.inner;
        let entry = with_retry(&self.retry, "fetch_entry", move || inner.fetch_entry(bid)).await?;
        Ok(entry.filter(|entry| {
            let ok = entry.is_well_formed() && &entry.bid == bid;
            if !ok {
                warn!(bid = %bid, "Skipping malformed entry");
            }
            ok
        }))
    }

    /// The entry a comment ultimately responds to, followed by every comment
    /// from the top of the chain down to `comment`.
    ///
    /// When the chain starts at a user rather than an entry, only the
    /// comments are returned.
    pub async fn comment_chain(&self, comment: &Bid) -> ApiResult<Vec<Entry>> {
        let mut chain = Vec::new();
        let mut next = Some(comment.clone());

        while let Some(bid) = next.take() {
            if !bid.is_entry() {
                break;
            }
            if chain.len() > MAX_CHAIN_DEPTH {
                return Err(ApiError::Rejected(format!("comment chain of {comment} does not end")));
            }
            let entry = self
                .fetch_entry(&bid)
                .await?
                .ok_or_else(|| ApiError::Rejected(format!("entry {bid} not found")))?;
            next = entry.parent().cloned();
            chain.push(entry);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Every comment below `root`, as a tree ordered by `(timestamp, BID)`.
    pub async fn comment_tree(&self, root: &Bid) -> ApiResult<Vec<CommentThread>> {
        let mut levels: Vec<Vec<Entry>> = Vec::new();
        let mut parents = vec![root.clone()];

        while !parents.is_empty() {
            if levels.len() > MAX_CHAIN_DEPTH {
                return Err(ApiError::Rejected(format!("comment tree of {root} does not end")));
            }
            let mut level = Vec::new();
            for parent in &parents {
                level.extend(self.replies(parent).await?);
            }
            parents = level.iter().map(|c| c.bid.clone()).collect();
            levels.push(level);
        }

        // Assemble bottom-up so every reply is attached before its parent moves.
        let mut below: HashMap<Bid, Vec<CommentThread>> = HashMap::new();
        for level in levels.into_iter().rev() {
            let mut here: HashMap<Bid, Vec<CommentThread>> = HashMap::new();
            for comment in level {
                let replies = below.remove(&comment.bid).unwrap_or_default();
                let Some(parent) = comment.parent().cloned() else {
                    continue;
                };
                here.entry(parent).or_default().push(CommentThread { comment, replies });
            }
            below = here;
        }
        Ok(below.remove(root).unwrap_or_default())
    }

    /// Direct replies to `parent`, oldest first.
    pub async fn replies(&self, parent: &Bid) -> ApiResult<Vec<Entry>> {
        let query = EntryQuery::since(Timestamp::EPOCH)
            .kinds([EntryKind::Comment])
            .parent(parent.clone())
            .limit(PAGE_SIZE);
        self.fetch_all(&query).await
    }

    /// Whether the authenticated user already replied to `parent`.
    pub async fn has_replied(&self, parent: &Bid) -> ApiResult<bool> {
        let mine = self.replies(parent).await?;
        Ok(mine.iter().any(|reply| &reply.author == self.identity()))
    }

    pub async fn fetch_users(&self, query: &UserQuery) -> ApiResult<Vec<User>> {
        let inner = &self.inner;
        with_retry(&self.retry, "fetch_users", move || inner.fetch_users(query)).await
    }

    pub async fn fetch_user(&self, bid: &Bid) -> ApiResult<Option<User>> {
        let inner = &self.inner;
        with_retry(&self.retry, "fetch_user", move || inner.fetch_user(bid)).await
    }

    /// The authenticated user's own record, including its balance.
    pub async fn whoami(&self) -> ApiResult<User> {
        let identity = self.identity().clone();
        self.fetch_user(&identity)
            .await?
            .ok_or_else(|| ApiError::Rejected(format!("own user record {identity} not found")))
    }

    pub async fn fetch_relation(&self, kind: RelationKind, target: &Bid) -> ApiResult<Vec<Bid>> {
        let inner = &self.inner;
        with_retry(&self.retry, "fetch_relation", move || {
            inner.fetch_relation(kind, target)
        })
        .await
    }

    /// Whether the authenticated user holds `kind` towards `target`.
    pub async fn has_relation(&self, kind: RelationKind, target: &Bid) -> ApiResult<bool> {
        let holders = self.fetch_relation(kind, target).await?;
        Ok(holders.contains(self.identity()))
    }

    // -------------------------------------------------------------------------
    // Writes (never retried)
    // -------------------------------------------------------------------------

    /// Creates an entry. Exactly one attempt is made.
    pub async fn mutate(&self, mutation: Mutation) -> ApiResult<Bid> {
        let author = self.identity().kind().user_kind().ok_or_else(|| {
            ApiError::InvalidMutation(format!("{} is not a user", self.identity()))
        })?;
        mutation.validate(author)?;

        info!(identity = %self.identity(), kind = %mutation.kind(), "Submitting mutation");
        match self.inner.mutate(&mutation).await {
            Ok(bid) => {
                debug!(bid = %bid, "Mutation accepted");
                Ok(bid)
            }
            Err(ApiError::Transient(reason)) => {
                warn!(kind = %mutation.kind(), reason = %reason, "Mutation outcome unknown, not retrying");
                Err(ApiError::TransientMutate(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Sets or clears a relation. Exactly one attempt is made.
    pub async fn set_relation(&self, kind: RelationKind, target: &Bid, active: bool) -> ApiResult<()> {
        if !kind.accepts(target) {
            return Err(ApiError::InvalidMutation(format!(
                "{} cannot target {target}",
                kind.as_str()
            )));
        }

        info!(relation = kind.as_str(), target = %target, active, "Updating relation");
        self.inner
            .set_relation(kind, target, active)
            .await
            .map_err(|e| match e {
                ApiError::Transient(reason) => ApiError::TransientMutate(reason),
                other => other,
            })
    }

    pub async fn post(&self, title: impl Into<String>, description: impl Into<String>) -> ApiResult<Bid> {
        self.mutate(Mutation::Post {
            title: title.into(),
            description: description.into(),
        })
        .await
    }

    pub async fn comment(&self, parent: &Bid, description: impl Into<String>) -> ApiResult<Bid> {
        self.mutate(Mutation::Comment {
            parent: parent.clone(),
            description: description.into(),
        })
        .await
    }

    pub async fn donate(&self, target: &Bid, amount: Cents, description: impl Into<String>) -> ApiResult<Bid> {
        self.mutate(Mutation::Donation {
            target: target.clone(),
            amount,
            description: description.into(),
        })
        .await
    }

    pub async fn transfer(&self, target: &Bid, amount: Cents, description: impl Into<String>) -> ApiResult<Bid> {
        self.mutate(Mutation::Transaction {
            target: target.clone(),
            amount,
            description: description.into(),
        })
        .await
    }

    pub async fn like(&self, target: &Bid) -> ApiResult<()> {
        self.set_relation(RelationKind::Like, target, true).await
    }

    pub async fn rsvp(&self, event: &Bid) -> ApiResult<()> {
        self.set_relation(RelationKind::Rsvp, event, true).await
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("identity", self.identity())
            .field("retry", &self.retry)
            .finish()
    }
}

/// Runs a side-effect-free operation under `retry`.
///
/// Only [`ApiError::Transient`] failures are retried. Exhaustion is reported
/// as [`ApiError::TransientFetch`].
async fn with_retry<T, F, Fut>(retry: &RetryConfig, operation: &'static str, mut f: F) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(ApiError::Transient(reason)) if attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(operation, attempt, delay = ?delay, reason = %reason, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(ApiError::Transient(reason)) => {
                warn!(operation, attempts = attempt, reason = %reason, "Giving up after transient failures");
                return Err(ApiError::TransientFetch {
                    attempts: attempt,
                    reason,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::EntryKind;
    use crate::model::EntryPayload;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyApi {
        identity: Bid,
        fail_reads: u32,
        reads: AtomicU32,
        writes: AtomicU32,
    }

    impl FlakyApi {
        fn new(fail_reads: u32) -> Self {
            Self {
                identity: Bid::user(UserKind::Person, "me"),
                fail_reads,
                reads: AtomicU32::new(0),
                writes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PlatformApi for FlakyApi {
        fn identity(&self) -> &Bid {
            &self.identity
        }

        async fn fetch_entries(&self, _query: &EntryQuery) -> ApiResult<Vec<Entry>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_reads {
                return Err(ApiError::Transient("connection reset".into()));
            }
            Ok(vec![
                Entry {
                    bid: Bid::entry(EntryKind::Post, "ok"),
                    created: Timestamp::from_millis(20),
                    author: Bid::user(UserKind::Person, "u"),
                    payload: EntryPayload::Post {
                        title: "t".into(),
                        description: String::new(),
                    },
                },
                Entry {
                    bid: Bid::entry(EntryKind::Comment, "bad"),
                    created: Timestamp::from_millis(20),
                    author: Bid::user(UserKind::Person, "u"),
                    payload: EntryPayload::Post {
                        title: "t".into(),
                        description: String::new(),
                    },
                },
                Entry {
                    bid: Bid::entry(EntryKind::Post, "old"),
                    created: Timestamp::from_millis(5),
                    author: Bid::user(UserKind::Person, "u"),
                    payload: EntryPayload::Post {
                        title: "t".into(),
                        description: String::new(),
                    },
                },
            ])
        }

        async fn fetch_entry(&self, _bid: &Bid) -> ApiResult<Option<Entry>> {
            Ok(None)
        }

        async fn fetch_users(&self, _query: &UserQuery) -> ApiResult<Vec<User>> {
            Ok(Vec::new())
        }

        async fn fetch_user(&self, _bid: &Bid) -> ApiResult<Option<User>> {
            Ok(None)
        }

        async fn mutate(&self, _mutation: &Mutation) -> ApiResult<Bid> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::Transient("timed out".into()))
        }

        async fn fetch_relation(&self, _kind: RelationKind, _target: &Bid) -> ApiResult<Vec<Bid>> {
            Ok(vec![self.identity.clone()])
        }

        async fn set_relation(&self, _kind: RelationKind, _target: &Bid, _active: bool) -> ApiResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_retry_then_succeed_and_filter() {
        let api = Arc::new(FlakyApi::new(3));
        let client = ApiClient::new(api.clone(), RetryConfig::default());

        let entries = client
            .fetch_entries(&EntryQuery::since(Timestamp::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(api.reads.load(Ordering::SeqCst), 4);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bid.id(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_give_up_after_max_attempts() {
        let api = Arc::new(FlakyApi::new(u32::MAX));
        let client = ApiClient::new(api.clone(), RetryConfig::default());

        let err = client
            .fetch_entries(&EntryQuery::since(Timestamp::EPOCH))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TransientFetch { attempts: 5, .. }));
        assert_eq!(api.reads.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_never_retried() {
        let api = Arc::new(FlakyApi::new(0));
        let client = ApiClient::new(api.clone(), RetryConfig::default());

        let err = client.post("hello", "world").await.unwrap_err();
        assert!(matches!(err, ApiError::TransientMutate(_)));
        assert_eq!(api.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_mutations_never_reach_the_platform() {
        let api = Arc::new(FlakyApi::new(0));
        let client = ApiClient::new(api.clone(), RetryConfig::default());

        let person = Bid::user(UserKind::Person, "friend");
        let err = client.donate(&person, Cents(100), "thanks").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidMutation(_)));

        let charity = Bid::user(UserKind::Nonprofit, "charity");
        let err = client.donate(&charity, Cents(0), "zero").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidMutation(_)));

        let err = client
            .mutate(Mutation::News {
                title: "news".into(),
                description: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidMutation(_)));

        assert_eq!(api.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_has_relation() {
        let client = ApiClient::new(Arc::new(FlakyApi::new(0)), RetryConfig::default());
        let post = Bid::entry(EntryKind::Post, "p");
        assert!(client.has_relation(RelationKind::Like, &post).await.unwrap());
    }

    #[tokio::test]
    async fn test_page_counts_dropped_entries() {
        let client = ApiClient::new(Arc::new(FlakyApi::new(0)), RetryConfig::none());

        let page = client
            .fetch_page(&EntryQuery::since(Timestamp::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(page.fetched, 3);
        assert_eq!(page.entries.len(), 1);
    }

    #[test]
    fn test_query_filters() {
        let me = Bid::user(UserKind::Person, "me");
        let charity = Bid::user(UserKind::Nonprofit, "charity");
        let post = Bid::entry(EntryKind::Post, "p");
        let reply = Entry {
            bid: Bid::entry(EntryKind::Comment, "c"),
            created: Timestamp::from_millis(5),
            author: me.clone(),
            payload: EntryPayload::Comment {
                parent: post.clone(),
                description: "hi".into(),
            },
        };
        let gift = Entry {
            bid: Bid::entry(EntryKind::Donation, "d"),
            created: Timestamp::from_millis(5),
            author: Bid::user(UserKind::Person, "donor"),
            payload: EntryPayload::Donation {
                target: charity.clone(),
                amount: Cents(500),
                description: String::new(),
            },
        };

        let since = EntryQuery::since(Timestamp::EPOCH);
        assert!(since.clone().parent(post.clone()).matches(&reply));
        assert!(!since.clone().parent(post.clone()).matches(&gift));
        assert!(since.clone().by_user(me.clone()).matches(&reply));
        assert!(!since.clone().by_user(me).matches(&gift));
        // Received donations count for the recipient.
        assert!(since.clone().by_user(charity.clone()).matches(&gift));
        assert!(since.clone().target(charity).matches(&gift));

        assert_eq!(since.clone().parent(post).candidate_kinds(), [EntryKind::Comment]);
        assert_eq!(
            since
                .kinds([EntryKind::Donation, EntryKind::Post])
                .target(Bid::user(UserKind::Nonprofit, "x"))
                .candidate_kinds(),
            [EntryKind::Donation]
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(10), Duration::from_secs(5));
    }
}
