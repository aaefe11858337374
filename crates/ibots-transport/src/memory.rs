//! In-process platform.
//!
//! [`MemoryPlatform`] implements the platform API against shared in-memory
//! tables. It enforces the same authoring, receiving and balance rules as the
//! real platform, hands out sessions through [`PlatformConnector`], and can
//! inject faults so retry and crash-recovery behaviour can be exercised
//! without a network.
//!
//! Entries at the same timestamp are returned in insertion order, not BID
//! order, like the real platform.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use ibots_core::api::{EntryQuery, Mutation, PlatformApi, PlatformConnector, RelationKind, UserQuery};
use ibots_core::{ApiError, ApiResult, Bid, Cents, Credentials, Entry, EntryPayload, Timestamp, User, UserKind};

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    passwords: HashMap<String, String>,
    entries: Vec<Entry>,
    relations: HashMap<(RelationKind, Bid), Vec<Bid>>,
    clock: Timestamp,
    next_id: u64,
    faults: Faults,
    stats: PlatformStats,
}

#[derive(Debug, Default)]
struct Faults {
    reads: u32,
    writes: u32,
    lost_replies: u32,
}

/// Call counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStats {
    pub logins: u64,
    pub reads: u64,
    pub writes: u64,
    pub failed_reads: u64,
    pub failed_writes: u64,
}

impl Tables {
    fn user(&self, bid: &Bid) -> Option<&User> {
        self.users.iter().find(|u| &u.bid == bid)
    }

    fn user_mut(&mut self, bid: &Bid) -> Option<&mut User> {
        self.users.iter_mut().find(|u| &u.bid == bid)
    }

    fn entry_exists(&self, bid: &Bid) -> bool {
        self.entries.iter().any(|e| &e.bid == bid)
    }

    fn exists(&self, bid: &Bid) -> bool {
        self.user(bid).is_some() || self.entry_exists(bid)
    }

    fn tick(&mut self) -> Timestamp {
        self.clock = Timestamp::from_millis(self.clock.as_millis() + 1);
        self.clock
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("m{}", self.next_id)
    }

    fn read_fault(&mut self) -> ApiResult<()> {
        self.stats.reads += 1;
        if self.faults.reads > 0 {
            self.faults.reads -= 1;
            self.stats.failed_reads += 1;
            return Err(ApiError::Transient("injected read failure".into()));
        }
        Ok(())
    }
}

/// A complete platform living in process memory.
///
/// Cheap to clone; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlatform {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user that can log in with `password`.
    pub fn add_user(
        &self,
        kind: UserKind,
        username: &str,
        password: &str,
        full_name: &str,
        balance: Cents,
    ) -> Bid {
        let mut tables = self.tables.lock();
        let bid = Bid::user(kind, tables.fresh_id());
        tables.users.push(User {
            bid: bid.clone(),
            username: username.to_string(),
            full_name: full_name.to_string(),
            balance,
        });
        tables
            .passwords
            .insert(username.to_string(), password.to_string());
        bid
    }

    /// Inserts an entry as-is, bypassing validation.
    ///
    /// Used to seed history, including duplicates and odd timestamps.
    pub fn insert_entry(&self, entry: Entry) {
        let mut tables = self.tables.lock();
        if entry.created > tables.clock {
            tables.clock = entry.created;
        }
        tables.entries.push(entry);
    }

    /// Moves the platform clock; new entries are stamped after it.
    pub fn set_clock(&self, now: Timestamp) {
        self.tables.lock().clock = now;
    }

    /// Fails the next `n` reads with a transient error.
    pub fn fail_reads(&self, n: u32) {
        self.tables.lock().faults.reads = n;
    }

    /// Fails the next `n` writes with a transient error before applying them.
    pub fn fail_writes(&self, n: u32) {
        self.tables.lock().faults.writes = n;
    }

    /// Applies the next `n` writes but reports a transient error for them.
    pub fn lose_write_replies(&self, n: u32) {
        self.tables.lock().faults.lost_replies = n;
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.tables.lock().entries.clone()
    }

    /// Entries authored by `author`.
    pub fn entries_by(&self, author: &Bid) -> Vec<Entry> {
        self.tables
            .lock()
            .entries
            .iter()
            .filter(|e| &e.author == author)
            .cloned()
            .collect()
    }

    pub fn user(&self, bid: &Bid) -> Option<User> {
        self.tables.lock().user(bid).cloned()
    }

    pub fn stats(&self) -> PlatformStats {
        self.tables.lock().stats
    }

    fn apply(&self, author: &Bid, mutation: &Mutation) -> ApiResult<Bid> {
        let mut tables = self.tables.lock();
        tables.stats.writes += 1;

        if tables.faults.writes > 0 {
            tables.faults.writes -= 1;
            tables.stats.failed_writes += 1;
            return Err(ApiError::Transient("injected write failure".into()));
        }

        let author_kind = tables
            .user(author)
            .and_then(|u| u.kind())
            .ok_or_else(|| ApiError::Rejected(format!("unknown author {author}")))?;
        if !author_kind.can_author(mutation.kind()) {
            return Err(ApiError::Rejected(format!(
                "a {author_kind} cannot create a {}",
                mutation.kind()
            )));
        }

        let payload = match mutation.clone() {
            Mutation::Post { title, description } => EntryPayload::Post { title, description },
            Mutation::News { title, description } => EntryPayload::News { title, description },
            Mutation::Comment { parent, description } => {
                if !tables.exists(&parent) {
                    return Err(ApiError::Rejected(format!("unknown parent {parent}")));
                }
                EntryPayload::Comment { parent, description }
            }
            Mutation::Event {
                title,
                description,
                date,
                duration,
                address,
            } => EntryPayload::Event {
                title,
                description,
                date,
                duration,
                address,
                rsvps: Vec::new(),
            },
            Mutation::Donation {
                target,
                amount,
                description,
            } => {
                transfer(&mut tables, author, &target, amount)?;
                EntryPayload::Donation {
                    target,
                    amount,
                    description,
                }
            }
            Mutation::Transaction {
                target,
                amount,
                description,
            } => {
                transfer(&mut tables, author, &target, amount)?;
                EntryPayload::Transaction {
                    target,
                    amount,
                    description,
                }
            }
        };

        let bid = Bid::entry(payload.kind(), tables.fresh_id());
        let created = tables.tick();
        tables.entries.push(Entry {
            bid: bid.clone(),
            created,
            author: author.clone(),
            payload,
        });
        debug!(bid = %bid, author = %author, "Stored entry");

        if tables.faults.lost_replies > 0 {
            tables.faults.lost_replies -= 1;
            tables.stats.failed_writes += 1;
            return Err(ApiError::Transient("injected lost reply".into()));
        }
        Ok(bid)
    }
}

fn transfer(tables: &mut Tables, from: &Bid, to: &Bid, amount: Cents) -> ApiResult<()> {
    if tables.user(to).is_none() {
        return Err(ApiError::Rejected(format!("unknown recipient {to}")));
    }
    let sender = tables
        .user_mut(from)
        .ok_or_else(|| ApiError::Rejected(format!("unknown sender {from}")))?;
    if sender.balance < amount {
        return Err(ApiError::Rejected(format!(
            "insufficient balance {} for {amount}",
            sender.balance
        )));
    }
    sender.balance = Cents(sender.balance.0 - amount.0);
    if let Some(recipient) = tables.user_mut(to) {
        recipient.balance = Cents(recipient.balance.0 + amount.0);
    }
    Ok(())
}

#[async_trait]
impl PlatformConnector for MemoryPlatform {
    async fn connect(&self, credentials: &Credentials) -> ApiResult<Arc<dyn PlatformApi>> {
        let mut tables = self.tables.lock();
        tables.stats.logins += 1;

        let known = tables
            .passwords
            .get(&credentials.username)
            .is_some_and(|p| *p == credentials.password);
        let identity = tables
            .users
            .iter()
            .find(|u| u.username == credentials.username)
            .map(|u| u.bid.clone());

        match identity {
            Some(identity) if known => {
                info!(username = %credentials.username, identity = %identity, "Memory platform login");
                Ok(Arc::new(MemorySession {
                    platform: self.clone(),
                    identity,
                }))
            }
            _ => Err(ApiError::Unauthorized {
                username: credentials.username.clone(),
            }),
        }
    }
}

/// A logged-in session on a [`MemoryPlatform`].
#[derive(Debug, Clone)]
pub struct MemorySession {
    platform: MemoryPlatform,
    identity: Bid,
}

#[async_trait]
impl PlatformApi for MemorySession {
    fn identity(&self) -> &Bid {
        &self.identity
    }

    async fn fetch_entries(&self, query: &EntryQuery) -> ApiResult<Vec<Entry>> {
        let mut tables = self.platform.tables.lock();
        tables.read_fault()?;

        let mut matching: Vec<Entry> = tables
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        // Stable: ties keep insertion order.
        matching.sort_by_key(|e| e.created);
        matching.truncate(query.limit);
        Ok(matching)
    }

    async fn fetch_entry(&self, bid: &Bid) -> ApiResult<Option<Entry>> {
        let mut tables = self.platform.tables.lock();
        tables.read_fault()?;
        Ok(tables.entries.iter().find(|e| &e.bid == bid).cloned())
    }

    async fn fetch_users(&self, query: &UserQuery) -> ApiResult<Vec<User>> {
        let mut tables = self.platform.tables.lock();
        tables.read_fault()?;

        let search = query.search.as_deref().map(str::to_lowercase);
        let users = tables
            .users
            .iter()
            .filter(|u| query.kind.is_none() || u.kind() == query.kind)
            .filter(|u| match &search {
                Some(s) => {
                    u.username.to_lowercase().contains(s) || u.full_name.to_lowercase().contains(s)
                }
                None => true,
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(users)
    }

    async fn fetch_user(&self, bid: &Bid) -> ApiResult<Option<User>> {
        let mut tables = self.platform.tables.lock();
        tables.read_fault()?;
        Ok(tables.user(bid).cloned())
    }

    async fn mutate(&self, mutation: &Mutation) -> ApiResult<Bid> {
        self.platform.apply(&self.identity, mutation)
    }

    async fn fetch_relation(&self, kind: RelationKind, target: &Bid) -> ApiResult<Vec<Bid>> {
        let mut tables = self.platform.tables.lock();
        tables.read_fault()?;
        Ok(tables
            .relations
            .get(&(kind, target.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_relation(&self, kind: RelationKind, target: &Bid, active: bool) -> ApiResult<()> {
        let mut tables = self.platform.tables.lock();
        tables.stats.writes += 1;
        if tables.faults.writes > 0 {
            tables.faults.writes -= 1;
            tables.stats.failed_writes += 1;
            return Err(ApiError::Transient("injected write failure".into()));
        }
        if !tables.exists(target) {
            return Err(ApiError::Rejected(format!("unknown target {target}")));
        }

        let holders = tables.relations.entry((kind, target.clone())).or_default();
        let has = holders.contains(&self.identity);
        if active && !has {
            holders.push(self.identity.clone());
        } else if !active && has {
            holders.retain(|b| b != &self.identity);
        }

        if kind == RelationKind::Rsvp {
            let identity = self.identity.clone();
            if let Some(Entry {
                payload: EntryPayload::Event { rsvps, .. },
                ..
            }) = tables.entries.iter_mut().find(|e| &e.bid == target)
            {
                rsvps.retain(|b| b != &identity);
                if active {
                    rsvps.push(identity);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibots_core::{ApiClient, EntryKind, RetryConfig};

    fn platform() -> (MemoryPlatform, Bid, Bid) {
        let platform = MemoryPlatform::new();
        let bot = platform.add_user(UserKind::Person, "bot", "secret", "Hello Bot", Cents(1_000));
        let charity = platform.add_user(UserKind::Nonprofit, "charity", "pw", "Good Cause", Cents(0));
        (platform, bot, charity)
    }

    #[test]
    fn test_login_rejects_bad_password() {
        let (platform, _, _) = platform();
        let err = tokio_test::block_on(platform.connect(&Credentials::new("bot", "wrong")))
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_donation_moves_balance() {
        let (platform, bot, charity) = platform();
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::none());

        client.donate(&charity, Cents(250), "for the cause").await.unwrap();
        assert_eq!(platform.user(&bot).unwrap().balance, Cents(750));
        assert_eq!(platform.user(&charity).unwrap().balance, Cents(250));

        let err = client.donate(&charity, Cents(5_000), "too much").await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_lost_reply_is_applied_once() {
        let (platform, bot, charity) = platform();
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::default());

        platform.lose_write_replies(1);
        let err = client.donate(&charity, Cents(100), "gas").await.unwrap_err();
        assert!(matches!(err, ApiError::TransientMutate(_)));
        assert_eq!(platform.entries_by(&bot).len(), 1);
        assert_eq!(platform.user(&bot).unwrap().balance, Cents(900));
    }

    #[tokio::test]
    async fn test_fetch_respects_cursor_kinds_and_limit() {
        let (platform, bot, _) = platform();
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::none());

        let first = client.post("one", "").await.unwrap();
        let second = client.post("two", "").await.unwrap();
        client.comment(&first, "nice").await.unwrap();

        let created = platform.entries()[1].created;
        let query = EntryQuery::since(created).kinds([EntryKind::Post]).limit(10);
        let page = client.fetch_entries(&query).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].bid, second);
        assert_eq!(page[0].author, bot);
    }

    #[tokio::test]
    async fn test_fetch_filters_by_user_parent_and_target() {
        let (platform, bot, charity) = platform();
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::none());

        let post = client.post("hi", "").await.unwrap();
        let reply = client.comment(&post, "first").await.unwrap();
        let donation = client.donate(&charity, Cents(10), "gift").await.unwrap();

        let since = EntryQuery::since(Timestamp::EPOCH).limit(10);
        let bids = |entries: Vec<Entry>| entries.into_iter().map(|e| e.bid).collect::<Vec<_>>();

        let mine = client.fetch_entries(&since.clone().by_user(bot)).await.unwrap();
        assert_eq!(bids(mine), vec![post.clone(), reply.clone(), donation.clone()]);

        let received = client.fetch_entries(&since.clone().by_user(charity.clone())).await.unwrap();
        assert_eq!(bids(received), vec![donation.clone()]);

        let replies = client.fetch_entries(&since.clone().parent(post)).await.unwrap();
        assert_eq!(bids(replies), vec![reply]);

        let gifts = client.fetch_entries(&since.target(charity)).await.unwrap();
        assert_eq!(bids(gifts), vec![donation]);
    }

    #[tokio::test]
    async fn test_comment_chain_and_tree() {
        let (platform, bot, _) = platform();
        platform.add_user(UserKind::Person, "guest", "pw", "Guest", Cents(0));
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::none());
        let guest = platform.connect(&Credentials::new("guest", "pw")).await.unwrap();
        let guest = ApiClient::new(guest, RetryConfig::none());

        let post = client.post("hello", "").await.unwrap();
        let question = guest.comment(&post, "who are you?").await.unwrap();
        let other = guest.comment(&post, "hi!").await.unwrap();
        let answer = client.comment(&question, "a bot").await.unwrap();

        let chain = client.comment_chain(&answer).await.unwrap();
        let chain: Vec<_> = chain.iter().map(|e| e.bid.clone()).collect();
        assert_eq!(chain, vec![post.clone(), question.clone(), answer.clone()]);

        let tree = client.comment_tree(&post).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].comment.bid, question);
        assert_eq!(tree[0].replies.len(), 1);
        assert_eq!(tree[0].replies[0].comment.bid, answer);
        assert_eq!(tree[0].replies[0].comment.author, bot);
        assert_eq!(tree[1].comment.bid, other);
        assert!(tree[1].replies.is_empty());

        assert!(client.has_replied(&question).await.unwrap());
        assert!(!client.has_replied(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_all_pages_past_limit() {
        let (platform, _, _) = platform();
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::none());

        let post = client.post("busy", "").await.unwrap();
        for n in 0..7 {
            client.comment(&post, format!("reply {n}")).await.unwrap();
        }

        let query = EntryQuery::since(Timestamp::EPOCH).parent(post).limit(3);
        assert_eq!(client.fetch_all(&query).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_relations_toggle() {
        let (platform, bot, _) = platform();
        let session = platform.connect(&Credentials::new("bot", "secret")).await.unwrap();
        let client = ApiClient::new(session, RetryConfig::none());

        let post = client.post("hi", "").await.unwrap();
        client.like(&post).await.unwrap();
        client.like(&post).await.unwrap();
        assert_eq!(client.fetch_relation(RelationKind::Like, &post).await.unwrap(), vec![bot]);

        client.set_relation(RelationKind::Like, &post, false).await.unwrap();
        assert!(!client.has_relation(RelationKind::Like, &post).await.unwrap());
    }
}
