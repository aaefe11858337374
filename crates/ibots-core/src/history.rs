//! Event deduplication and per-bot history tracking.
//!
//! The platform's event history is "dirty": pages overlap, items show up late,
//! and the same entry can be returned more than once. The [`HistoryTracker`]
//! turns raw pages into a deterministic, duplicate-free dispatch order and
//! keeps the cursor that makes that order survive restarts.
//!
//! The cursor is `(last_timestamp, seen)`: every entry strictly older than
//! `last_timestamp` has been handled, and `seen` lists the entries at exactly
//! `last_timestamp` that have been handled. Entries are dispatched in
//! `(timestamp, BID)` order.
//!
//! Two cursors are kept. The working cursor advances after every successful
//! dispatch; the persisted checkpoint only moves when the caller has durably
//! written it and calls [`HistoryTracker::commit`]. A failed batch rolls the
//! working cursor back to the persisted one, so the next cycle re-derives the
//! same batch. The bot state is never rolled back.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::api::{EntryPage, EntryQuery};
use crate::bid::{Bid, EntryKind};
use crate::model::{Entry, Timestamp};

/// Free-form state a bot persists alongside its cursor.
pub type BotState = Map<String, Value>;

/// Position in a bot's event history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_timestamp: Timestamp,
    /// Entries at exactly `last_timestamp` that were already handled.
    #[serde(default)]
    pub seen: BTreeSet<Bid>,
}

impl Cursor {
    /// A cursor at `timestamp` with the given already-handled entries.
    pub fn at(timestamp: Timestamp, seen: impl IntoIterator<Item = Bid>) -> Self {
        Self {
            last_timestamp: timestamp,
            seen: seen.into_iter().collect(),
        }
    }

    /// Whether `entry` is past this cursor.
    pub fn is_new(&self, entry: &Entry) -> bool {
        match entry.created.cmp(&self.last_timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !self.seen.contains(&entry.bid),
            std::cmp::Ordering::Less => false,
        }
    }

    /// Moves the cursor past `entry`.
    ///
    /// Entries older than the cursor leave it unchanged.
    pub fn advance(&mut self, entry: &Entry) {
        match entry.created.cmp(&self.last_timestamp) {
            std::cmp::Ordering::Greater => {
                self.last_timestamp = entry.created;
                self.seen.clear();
                self.seen.insert(entry.bid.clone());
            }
            std::cmp::Ordering::Equal => {
                self.seen.insert(entry.bid.clone());
            }
            std::cmp::Ordering::Less => {}
        }
    }
}

/// The durable per-bot record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cursor: Cursor,
    #[serde(default)]
    pub state: BotState,
}

impl Checkpoint {
    pub fn new(cursor: Cursor, state: BotState) -> Self {
        Self { cursor, state }
    }
}

/// Page size limits for history fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: usize,
    pub max_page_size: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            page_size: 25,
            max_page_size: 400,
        }
    }
}

/// Deduplicates and orders one bot's event stream.
#[derive(Debug, Clone)]
pub struct HistoryTracker {
    persisted: Checkpoint,
    working: Cursor,
    pending: usize,
    limits: PageLimits,
    limit: usize,
}

impl HistoryTracker {
    /// Starts from a loaded checkpoint.
    pub fn new(checkpoint: Checkpoint, limits: PageLimits) -> Self {
        let page_size = limits.page_size.max(1);
        Self {
            working: checkpoint.cursor.clone(),
            persisted: checkpoint,
            pending: 0,
            limits: PageLimits {
                page_size,
                max_page_size: limits.max_page_size.max(page_size),
            },
            limit: page_size,
        }
    }

    /// The in-memory cursor, including unpersisted progress.
    pub fn cursor(&self) -> &Cursor {
        &self.working
    }

    /// The last checkpoint known to be durable.
    pub fn persisted(&self) -> &Checkpoint {
        &self.persisted
    }

    /// Entries dispatched since the last commit.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// The query for the next page, restricted to `kinds` (empty means all).
    pub fn next_query(&self, kinds: &[EntryKind]) -> EntryQuery {
        EntryQuery::since(self.working.last_timestamp)
            .kinds(kinds.iter().copied())
            .limit(self.limit)
    }

    /// Turns a raw page into the ordered list of entries to dispatch.
    ///
    /// `page` must be the response to the last [`next_query`](Self::next_query).
    /// Entries behind the cursor are dropped, duplicates are collapsed, and the
    /// result is sorted by `(timestamp, BID)`. The page counts as full by its
    /// raw size, so entries the client dropped still widen a stalled page.
    pub fn plan(&mut self, page: impl Into<EntryPage>) -> Vec<Entry> {
        let EntryPage { entries, fetched } = page.into();
        let mut batch: Vec<Entry> = entries
            .into_iter()
            .filter(|entry| {
                if entry.created < self.working.last_timestamp {
                    debug!(
                        bid = %entry.bid,
                        created = %entry.created,
                        cursor = %self.working.last_timestamp,
                        "Dropping late arrival behind cursor"
                    );
                    return false;
                }
                self.working.is_new(entry)
            })
            .collect();

        batch.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));

        let mut in_batch = HashSet::with_capacity(batch.len());
        batch.retain(|entry| {
            let first = in_batch.insert(entry.bid.clone());
            if !first {
                debug!(bid = %entry.bid, "Collapsing duplicate entry in page");
            }
            first
        });

        self.adjust_page(fetched, batch.is_empty());
        batch
    }

    /// Records a successful dispatch of `entry`.
    pub fn mark_dispatched(&mut self, entry: &Entry) {
        self.working.advance(entry);
        self.pending += 1;
    }

    /// Builds the checkpoint to persist from the working cursor and `state`.
    pub fn snapshot(&self, state: &BotState) -> Checkpoint {
        Checkpoint::new(self.working.clone(), state.clone())
    }

    /// Marks `checkpoint` as durably written.
    pub fn commit(&mut self, checkpoint: Checkpoint) {
        self.persisted = checkpoint;
        self.pending = 0;
    }

    /// Rewinds the cursor to the persisted checkpoint.
    ///
    /// Only the cursor moves back. The bot state is the handler's to keep, so
    /// the records it made for entries that will be re-delivered survive.
    pub fn rollback(&mut self) {
        if self.pending > 0 {
            debug!(
                discarded = self.pending,
                cursor = %self.persisted.cursor.last_timestamp,
                "Rolling back to persisted checkpoint"
            );
        }
        self.working = self.persisted.cursor.clone();
        self.pending = 0;
    }

    /// Current page size.
    pub fn page_limit(&self) -> usize {
        self.limit
    }

    // A full page with nothing new means more entries share the cursor
    // timestamp than fit in a page.
    fn adjust_page(&mut self, fetched: usize, stalled: bool) {
        if stalled && fetched >= self.limit {
            if self.limit < self.limits.max_page_size {
                self.limit = (self.limit * 2).min(self.limits.max_page_size);
                debug!(page_size = self.limit, "Widening page to get past a crowded timestamp");
            } else {
                warn!(
                    page_size = self.limit,
                    cursor = %self.working.last_timestamp,
                    "History is stalled at the maximum page size"
                );
            }
        } else if !stalled {
            self.limit = self.limits.page_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::UserKind;
    use crate::model::EntryPayload;

    fn post(id: &str, at: i64) -> Entry {
        Entry {
            bid: Bid::entry(EntryKind::Post, id),
            created: Timestamp::from_millis(at),
            author: Bid::user(UserKind::Person, "author"),
            payload: EntryPayload::Post {
                title: id.to_string(),
                description: String::new(),
            },
        }
    }

    fn ids(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.bid.id()).collect()
    }

    fn checkpoint_at(at: i64, seen: &[&str]) -> Checkpoint {
        Checkpoint::new(
            Cursor::at(
                Timestamp::from_millis(at),
                seen.iter().map(|id| Bid::entry(EntryKind::Post, *id)),
            ),
            BotState::new(),
        )
    }

    #[test]
    fn test_fresh_bot_orders_equal_timestamps_by_bid() {
        let mut tracker = HistoryTracker::new(Checkpoint::default(), PageLimits::default());

        let batch = tracker.plan(vec![post("b", 10), post("a", 10)]);
        assert_eq!(ids(&batch), ["a", "b"]);

        for entry in &batch {
            tracker.mark_dispatched(entry);
        }
        let checkpoint = tracker.snapshot(&BotState::new());
        tracker.commit(checkpoint);
        let expected = Cursor::at(
            Timestamp::from_millis(10),
            [Bid::entry(EntryKind::Post, "a"), Bid::entry(EntryKind::Post, "b")],
        );
        assert_eq!(tracker.persisted().cursor, expected);
    }

    #[test]
    fn test_replayed_page_only_yields_unseen_entries() {
        let mut tracker = HistoryTracker::new(checkpoint_at(100, &["A"]), PageLimits::default());

        let batch = tracker.plan(vec![post("C", 101), post("B", 100), post("A", 100)]);
        assert_eq!(ids(&batch), ["B", "C"]);

        for entry in &batch {
            tracker.mark_dispatched(entry);
        }
        let expected = Cursor::at(
            Timestamp::from_millis(101),
            [Bid::entry(EntryKind::Post, "C")],
        );
        assert_eq!(tracker.cursor(), &expected);
    }

    #[test]
    fn test_crash_before_persist_redelivers_batch() {
        let persisted = checkpoint_at(100, &["A"]);
        let raw = vec![post("A", 100), post("B", 100), post("C", 101)];

        let mut first = HistoryTracker::new(persisted.clone(), PageLimits::default());
        let batch = first.plan(raw.clone());
        first.mark_dispatched(&batch[0]);
        drop(first);

        let mut restarted = HistoryTracker::new(persisted, PageLimits::default());
        assert_eq!(ids(&restarted.plan(raw)), ["B", "C"]);
    }

    #[test]
    fn test_committed_entries_are_never_redelivered() {
        let mut tracker = HistoryTracker::new(Checkpoint::default(), PageLimits::default());
        let raw = vec![post("A", 10), post("B", 10)];

        for entry in tracker.plan(raw.clone()) {
            tracker.mark_dispatched(&entry);
        }
        let checkpoint = tracker.snapshot(&BotState::new());
        tracker.commit(checkpoint.clone());

        let mut restarted = HistoryTracker::new(checkpoint, PageLimits::default());
        assert!(restarted.plan(raw).is_empty());
    }

    #[test]
    fn test_rollback_rewinds_cursor_only() {
        let persisted = checkpoint_at(0, &[]);
        let mut tracker = HistoryTracker::new(persisted.clone(), PageLimits::default());

        let batch = tracker.plan(vec![post("A", 1), post("B", 2)]);
        tracker.mark_dispatched(&batch[0]);
        assert_eq!(tracker.pending(), 1);

        tracker.rollback();
        assert_eq!(tracker.pending(), 0);
        assert_eq!(tracker.cursor(), &persisted.cursor);
        assert_eq!(ids(&tracker.plan(vec![post("A", 1), post("B", 2)])), ["A", "B"]);

        // Persisting now keeps the old cursor with the newer state.
        let mut state = BotState::new();
        state.insert("done:A".into(), Value::Bool(true));
        let checkpoint = tracker.snapshot(&state);
        assert_eq!(checkpoint.cursor, persisted.cursor);
        assert_eq!(checkpoint.state.get("done:A"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_ties_break_on_bid_and_duplicates_collapse() {
        let mut tracker = HistoryTracker::new(Checkpoint::default(), PageLimits::default());
        let batch = tracker.plan(vec![
            post("b", 5),
            post("a", 5),
            post("b", 5),
            post("z", 4),
        ]);
        assert_eq!(ids(&batch), ["z", "a", "b"]);
    }

    #[test]
    fn test_late_arrivals_are_dropped() {
        let mut tracker = HistoryTracker::new(checkpoint_at(50, &[]), PageLimits::default());
        assert_eq!(ids(&tracker.plan(vec![post("old", 49), post("new", 50)])), ["new"]);
    }

    #[test]
    fn test_page_widens_on_crowded_timestamp() {
        let limits = PageLimits {
            page_size: 2,
            max_page_size: 5,
        };
        let mut tracker = HistoryTracker::new(checkpoint_at(7, &["a", "b"]), limits);
        assert_eq!(tracker.next_query(&[]).limit, 2);

        assert!(tracker.plan(vec![post("a", 7), post("b", 7)]).is_empty());
        assert_eq!(tracker.page_limit(), 4);

        tracker.plan(vec![post("a", 7), post("b", 7), post("c", 7), post("d", 7)]);
        assert_eq!(tracker.page_limit(), 2);
    }

    #[test]
    fn test_page_widens_when_client_dropped_entries() {
        let limits = PageLimits {
            page_size: 3,
            max_page_size: 12,
        };
        let mut tracker = HistoryTracker::new(checkpoint_at(7, &["a", "b"]), limits);

        // Three entries came back; one was malformed and never reached us.
        let page = EntryPage {
            entries: vec![post("a", 7), post("b", 7)],
            fetched: 3,
        };
        assert!(tracker.plan(page).is_empty());
        assert_eq!(tracker.page_limit(), 6);
    }

    #[test]
    fn test_page_width_is_capped() {
        let limits = PageLimits {
            page_size: 2,
            max_page_size: 3,
        };
        let mut tracker = HistoryTracker::new(checkpoint_at(7, &["a", "b", "c"]), limits);
        tracker.plan(vec![post("a", 7), post("b", 7)]);
        tracker.plan(vec![post("a", 7), post("b", 7), post("c", 7)]);
        assert_eq!(tracker.page_limit(), 3);
    }

    #[test]
    fn test_checkpoint_serde_uses_bid_text_form() {
        let checkpoint = checkpoint_at(3, &["x"]);
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["cursor"]["seen"][0], "post:x");
        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
