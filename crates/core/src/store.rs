//! Session State Store
//!
//! Holds the last-known authoritative `SessionSnapshot` and is the only place
//! it is mutated. Responses are tagged with a [`RequestTicket`] when their
//! request is issued, so a reply that completes after a newer one has been
//! applied can be recognised and dropped.

use crate::checklist;
use crate::snapshot::SessionSnapshot;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies the request a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestTicket {
    epoch: u64,
    seq: u64,
}

impl RequestTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// The result of merging a response into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The snapshot was stored; carries the ids of newly completed items.
    Applied(Vec<String>),
    /// The response was older than what is already applied, or predates the
    /// last reset. Nothing changed.
    Stale,
}

impl MergeOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, MergeOutcome::Stale)
    }

    /// Newly completed item ids; empty for a stale merge.
    pub fn completed_items(&self) -> &[String] {
        match self {
            MergeOutcome::Applied(ids) => ids,
            MergeOutcome::Stale => &[],
        }
    }
}

/// A live view of the store. Yields the value current at subscription time
/// first, then every later update. Dropping it unsubscribes.
pub struct SnapshotSubscription {
    rx: mpsc::UnboundedReceiver<Option<SessionSnapshot>>,
}

impl SnapshotSubscription {
    /// Waits for the next value; `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Option<SessionSnapshot>> {
        self.rx.recv().await
    }

    /// Returns a value if one is already queued.
    pub fn try_next(&mut self) -> Option<Option<SessionSnapshot>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub struct SessionStateStore {
    current: Option<SessionSnapshot>,
    epoch: u64,
    next_seq: u64,
    last_applied: Option<RequestTicket>,
    subscribers: Vec<mpsc::UnboundedSender<Option<SessionSnapshot>>>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&SessionSnapshot> {
        self.current.as_ref()
    }

    /// Issues the ticket for a request about to be sent.
    pub fn begin_request(&mut self) -> RequestTicket {
        self.next_seq += 1;
        RequestTicket {
            epoch: self.epoch,
            seq: self.next_seq,
        }
    }

    /// Installs the first snapshot of a new session. A new session always
    /// wins: every request still outstanding belongs to the previous one and
    /// becomes stale.
    pub fn start_session(&mut self, incoming: SessionSnapshot) -> MergeOutcome {
        self.epoch += 1;
        self.last_applied = None;
        let transitions = checklist::diff(None, &incoming.checklist.completion());
        self.publish(Some(incoming));
        MergeOutcome::Applied(transitions)
    }

    /// Merges a response issued under `ticket`.
    ///
    /// Within one session lifetime completion is sticky, items missing from
    /// `incoming` are carried over, and remaining minutes never go up. A
    /// snapshot with a different session id replaces the stored one outright.
    pub fn merge(&mut self, ticket: RequestTicket, incoming: SessionSnapshot) -> MergeOutcome {
        if self.is_outdated(ticket) {
            debug!(
                seq = ticket.seq,
                last_applied = ?self.last_applied.map(|t| t.seq),
                "Discarding stale session response"
            );
            return MergeOutcome::Stale;
        }
        self.last_applied = Some(ticket);
        MergeOutcome::Applied(self.apply(incoming))
    }

    /// Merges a response that no other request supersedes, such as the
    /// reply to a message. The same sticky rules as [`merge`](Self::merge)
    /// apply, so it can only add progress.
    pub fn merge_unordered(&mut self, incoming: SessionSnapshot) -> MergeOutcome {
        MergeOutcome::Applied(self.apply(incoming))
    }

    fn apply(&mut self, incoming: SessionSnapshot) -> Vec<String> {
        let (previous, merged) = match self.current.as_ref() {
            Some(stored) if stored.active && stored.same_session(&incoming) => {
                let mut merged = incoming;
                merged.checklist = stored.checklist.merged_with(&merged.checklist);
                merged.remaining_minutes = merged.remaining_minutes.min(stored.remaining_minutes);
                merged.completed |= stored.completed;
                if merged.session_id.is_none() {
                    merged.session_id = stored.session_id.clone();
                }
                (Some(stored.checklist.completion()), merged)
            }
            Some(stored) if stored.same_session(&incoming) => {
                (Some(stored.checklist.completion()), incoming)
            }
            _ => (None, incoming),
        };

        let transitions = checklist::diff(previous.as_ref(), &merged.checklist.completion());
        self.publish(Some(merged));
        transitions
    }

    /// Clears the store. Responses to requests issued before the reset are
    /// treated as stale.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.last_applied = None;
        self.publish(None);
    }

    fn is_outdated(&self, ticket: RequestTicket) -> bool {
        ticket.epoch != self.epoch || self.last_applied.is_some_and(|last| ticket.seq < last.seq)
    }

    pub fn subscribe(&mut self) -> SnapshotSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this send cannot fail.
        let _ = tx.send(self.current.clone());
        self.subscribers.push(tx);
        SnapshotSubscription { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }

    fn publish(&mut self, value: Option<SessionSnapshot>) {
        self.current = value;
        let current = &self.current;
        self.subscribers.retain(|tx| tx.send(current.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::ChecklistSnapshot;

    fn snapshot(session: &str, remaining: u32, items: &[(&str, bool)]) -> SessionSnapshot {
        SessionSnapshot {
            active: true,
            session_id: Some(session.to_string()),
            remaining_minutes: remaining,
            checklist: ChecklistSnapshot::from_pairs(items.iter().map(|(id, c)| (*id, *c))),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_merge_reports_completed_items() {
        let mut store = SessionStateStore::new();
        let ticket = store.begin_request();

        let outcome = store.merge(ticket, snapshot("s", 60, &[("rapport", true), ("validacion", false)]));
        assert_eq!(outcome, MergeOutcome::Applied(vec!["rapport".to_string()]));
        assert!(store.current().unwrap().checklist.is_completed("rapport"));
    }

    #[test]
    fn test_stale_response_does_not_overwrite_newer_one() {
        let mut store = SessionStateStore::new();
        let first = store.begin_request();
        let second = store.begin_request();

        store.merge(second, snapshot("s", 40, &[("rapport", true)]));
        let outcome = store.merge(first, snapshot("s", 50, &[("rapport", false)]));

        assert!(outcome.is_stale());
        let current = store.current().unwrap();
        assert_eq!(current.remaining_minutes, 40);
        assert!(current.checklist.is_completed("rapport"));
    }

    #[test]
    fn test_responses_in_issue_order_are_applied() {
        let mut store = SessionStateStore::new();
        let first = store.begin_request();
        let second = store.begin_request();

        assert!(!store.merge(first, snapshot("s", 50, &[])).is_stale());
        assert!(!store.merge(second, snapshot("s", 45, &[])).is_stale());
        assert_eq!(store.current().unwrap().remaining_minutes, 45);
    }

    #[test]
    fn test_completion_is_monotonic_across_merges() {
        let mut store = SessionStateStore::new();
        let reports = [
            vec![("rapport", true), ("validacion", false)],
            vec![("rapport", false), ("validacion", false)],
            vec![("rapport", true), ("validacion", true)],
            vec![("validacion", false)],
            vec![("rapport", true), ("validacion", true)],
        ];

        let mut completed_events = Vec::new();
        for report in &reports {
            let ticket = store.begin_request();
            let outcome = store.merge(ticket, snapshot("s", 60, report));
            completed_events.extend(outcome.completed_items().to_vec());
        }

        assert_eq!(completed_events, vec!["rapport", "validacion"]);
        let current = store.current().unwrap();
        assert!(current.checklist.is_completed("rapport"));
        assert!(current.checklist.is_completed("validacion"));
    }

    #[test]
    fn test_remaining_minutes_never_increase_within_session() {
        let mut store = SessionStateStore::new();
        let t1 = store.begin_request();
        store.merge(t1, snapshot("s", 30, &[]));
        let t2 = store.begin_request();
        store.merge(t2, snapshot("s", 45, &[]));

        assert_eq!(store.current().unwrap().remaining_minutes, 30);
    }

    #[test]
    fn test_new_session_replaces_previous_state() {
        let mut store = SessionStateStore::new();
        let t1 = store.begin_request();
        store.merge(t1, snapshot("old", 5, &[("rapport", true)]));

        let t2 = store.begin_request();
        let outcome = store.merge(t2, snapshot("new", 60, &[("rapport", false)]));

        assert_eq!(outcome, MergeOutcome::Applied(vec![]));
        let current = store.current().unwrap();
        assert_eq!(current.remaining_minutes, 60);
        assert!(!current.checklist.is_completed("rapport"));
    }

    #[test]
    fn test_reset_discards_in_flight_responses() {
        let mut store = SessionStateStore::new();
        let before_reset = store.begin_request();
        store.reset();

        assert!(store.merge(before_reset, snapshot("s", 60, &[])).is_stale());
        assert!(store.current().is_none());

        let after_reset = store.begin_request();
        assert!(!store.merge(after_reset, snapshot("s", 60, &[])).is_stale());
    }

    #[test]
    fn test_start_session_invalidates_outstanding_requests() {
        let mut store = SessionStateStore::new();
        let t1 = store.begin_request();
        store.merge(t1, snapshot("old", 30, &[("rapport", true)]));

        let status = store.begin_request();
        let outcome = store.start_session(snapshot("s", 60, &[("rapport", false)]));
        assert_eq!(outcome, MergeOutcome::Applied(vec![]));

        assert!(store.merge(status, snapshot("old", 20, &[("rapport", true)])).is_stale());
        assert!(!store.current().unwrap().checklist.is_completed("rapport"));

        let next = store.begin_request();
        assert!(!store.merge(next, snapshot("s", 59, &[])).is_stale());
    }

    #[test]
    fn test_start_session_applies_after_newer_response() {
        let mut store = SessionStateStore::new();
        let status = store.begin_request();
        store.merge(
            status,
            SessionSnapshot {
                active: false,
                ..Default::default()
            },
        );

        let outcome = store.start_session(snapshot("s", 6, &[]));
        assert!(!outcome.is_stale());
        let current = store.current().unwrap();
        assert!(current.active);
        assert_eq!(current.session_id.as_deref(), Some("s"));
        assert_eq!(current.remaining_minutes, 6);
    }

    #[test]
    fn test_unordered_merge_survives_newer_response() {
        let mut store = SessionStateStore::new();
        store.start_session(snapshot("s", 60, &[("rapport", false), ("validacion", false)]));

        let status = store.begin_request();
        store.merge(status, snapshot("s", 58, &[("rapport", false)]));

        let outcome = store.merge_unordered(snapshot("s", 59, &[("rapport", true)]));
        assert_eq!(outcome, MergeOutcome::Applied(vec!["rapport".to_string()]));
        let current = store.current().unwrap();
        assert!(current.checklist.is_completed("rapport"));
        assert_eq!(current.remaining_minutes, 58);

        let outcome = store.merge_unordered(snapshot("s", 59, &[("rapport", false)]));
        assert_eq!(outcome, MergeOutcome::Applied(vec![]));
        assert!(store.current().unwrap().checklist.is_completed("rapport"));
    }

    #[tokio::test]
    async fn test_subscribe_replays_latest_then_updates() {
        let mut store = SessionStateStore::new();
        let ticket = store.begin_request();
        store.merge(ticket, snapshot("s", 60, &[]));

        let mut subscription = store.subscribe();
        let first = subscription.next().await.unwrap().unwrap();
        assert_eq!(first.remaining_minutes, 60);

        let ticket = store.begin_request();
        store.merge(ticket, snapshot("s", 59, &[]));
        store.reset();

        assert_eq!(
            subscription.next().await.unwrap().unwrap().remaining_minutes,
            59
        );
        assert_eq!(subscription.next().await.unwrap(), None);
        assert!(subscription.try_next().is_none());
    }

    #[test]
    fn test_subscribe_to_empty_store_yields_none() {
        let mut store = SessionStateStore::new();
        let mut subscription = store.subscribe();
        assert_eq!(subscription.try_next(), Some(None));
    }

    #[test]
    fn test_stale_merge_does_not_notify_subscribers() {
        let mut store = SessionStateStore::new();
        let old = store.begin_request();
        let new = store.begin_request();
        store.merge(new, snapshot("s", 40, &[]));

        let mut subscription = store.subscribe();
        let _ = subscription.try_next();
        store.merge(old, snapshot("s", 50, &[]));
        assert!(subscription.try_next().is_none());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let mut store = SessionStateStore::new();
        let kept = store.subscribe();
        drop(store.subscribe());
        store.reset();

        assert_eq!(store.subscriber_count(), 1);
        drop(kept);
        assert_eq!(store.subscriber_count(), 0);
    }
}
