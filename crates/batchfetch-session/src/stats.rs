//! Statement and load statistics.
//!
//! A [`Statistics`] instance is owned by the [`SessionFactory`](crate::SessionFactory)
//! and shared by every session it opens. Tests read and reset the counters to
//! assert how many statements a loading episode cost.
//!
//! # Example
//!
//! ```ignore
//! let stats = factory.statistics();
//! stats.clear();
//!
//! session.initialize(&cx, &groups[0]).await;
//! assert_eq!(stats.prepare_count(), 1);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters for statements issued and entities loaded.
///
/// All counters are atomic; recording while disabled is a no-op.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: AtomicBool,
    prepare: AtomicU64,
    executed: AtomicU64,
    entity_fetch: AtomicU64,
    entity_load: AtomicU64,
    collection_fetch: AtomicU64,
    collection_load: AtomicU64,
    query_execution: AtomicU64,
    session_open: AtomicU64,
    session_close: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub prepare_count: u64,
    pub executed_count: u64,
    pub entity_fetch_count: u64,
    pub entity_load_count: u64,
    pub collection_fetch_count: u64,
    pub collection_load_count: u64,
    pub query_execution_count: u64,
    pub session_open_count: u64,
    pub session_close_count: u64,
}

impl Statistics {
    /// Create statistics with recording enabled or disabled.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ..Self::default()
        }
    }

    /// Check if recording is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn recording on or off. Counters keep their values.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64, by: u64) {
        if self.is_enabled() {
            counter.fetch_add(by, Ordering::Relaxed);
        }
    }

    /// Record one prepared statement.
    pub fn record_prepare(&self) {
        self.bump(&self.prepare, 1);
    }

    /// Record one executed statement.
    pub fn record_execute(&self) {
        self.bump(&self.executed, 1);
    }

    /// Record one proxy batch statement.
    pub fn record_entity_fetch(&self) {
        self.bump(&self.entity_fetch, 1);
    }

    /// Record `count` hydrated entities.
    pub fn record_entity_load(&self, count: u64) {
        self.bump(&self.entity_load, count);
    }

    /// Record one collection statement.
    pub fn record_collection_fetch(&self) {
        self.bump(&self.collection_fetch, 1);
    }

    /// Record `count` initialized collections.
    pub fn record_collection_load(&self, count: u64) {
        self.bump(&self.collection_load, count);
    }

    /// Record one list query.
    pub fn record_query_execution(&self) {
        self.bump(&self.query_execution, 1);
    }

    pub fn record_session_open(&self) {
        self.bump(&self.session_open, 1);
    }

    pub fn record_session_close(&self) {
        self.bump(&self.session_close, 1);
    }

    /// Number of statements prepared since the last [`clear`](Self::clear).
    #[must_use]
    pub fn prepare_count(&self) -> u64 {
        self.prepare.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn entity_fetch_count(&self) -> u64 {
        self.entity_fetch.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn entity_load_count(&self) -> u64 {
        self.entity_load.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn collection_fetch_count(&self) -> u64 {
        self.collection_fetch.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn collection_load_count(&self) -> u64 {
        self.collection_load.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn query_execution_count(&self) -> u64 {
        self.query_execution.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn session_open_count(&self) -> u64 {
        self.session_open.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn session_close_count(&self) -> u64 {
        self.session_close.load(Ordering::Relaxed)
    }

    /// Reset every counter to zero.
    pub fn clear(&self) {
        for counter in [
            &self.prepare,
            &self.executed,
            &self.entity_fetch,
            &self.entity_load,
            &self.collection_fetch,
            &self.collection_load,
            &self.query_execution,
            &self.session_open,
            &self.session_close,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            prepare_count: self.prepare_count(),
            executed_count: self.executed_count(),
            entity_fetch_count: self.entity_fetch_count(),
            entity_load_count: self.entity_load_count(),
            collection_fetch_count: self.collection_fetch_count(),
            collection_load_count: self.collection_load_count(),
            query_execution_count: self.query_execution_count(),
            session_open_count: self.session_open_count(),
            session_close_count: self.session_close_count(),
        }
    }

    /// Emit the counters as one `info` event.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            prepared = s.prepare_count,
            executed = s.executed_count,
            entity_fetches = s.entity_fetch_count,
            entities_loaded = s.entity_load_count,
            collection_fetches = s.collection_fetch_count,
            collections_loaded = s.collection_load_count,
            queries = s.query_execution_count,
            sessions_opened = s.session_open_count,
            sessions_closed = s.session_close_count,
            "Session statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_statistics_record_nothing() {
        let stats = Statistics::new(false);
        stats.record_prepare();
        stats.record_entity_load(5);
        assert_eq!(stats.prepare_count(), 0);
        assert_eq!(stats.entity_load_count(), 0);
    }

    #[test]
    fn counters_are_shared_across_threads() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 1000;

        let stats = std::sync::Arc::new(Statistics::new(true));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let stats = std::sync::Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        stats.record_prepare();
                        stats.record_entity_load(2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        assert_eq!(stats.prepare_count(), THREADS * PER_THREAD);
        assert_eq!(stats.entity_load_count(), THREADS * PER_THREAD * 2);
    }

    #[test]
    fn clear_resets_every_counter() {
        let stats = Statistics::new(true);
        stats.record_prepare();
        stats.record_execute();
        stats.record_collection_fetch();
        stats.record_collection_load(3);
        stats.record_session_open();
        assert_eq!(stats.prepare_count(), 1);
        assert_eq!(stats.collection_load_count(), 3);

        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
        assert!(stats.is_enabled());
    }

    #[test]
    fn toggling_keeps_counts() {
        let stats = Statistics::new(true);
        stats.record_prepare();
        stats.set_enabled(false);
        stats.record_prepare();
        assert_eq!(stats.prepare_count(), 1);
        stats.set_enabled(true);
        stats.record_prepare();
        assert_eq!(stats.prepare_count(), 2);
    }

    #[test]
    fn snapshot_copies_counters() {
        let stats = Statistics::new(true);
        stats.record_entity_fetch();
        stats.record_entity_load(2);
        stats.record_query_execution();
        let snap = stats.snapshot();
        assert_eq!(snap.entity_fetch_count, 1);
        assert_eq!(snap.entity_load_count, 2);
        assert_eq!(snap.query_execution_count, 1);
        stats.log_summary();
    }
}
