//! Time-to-live sweeping.

use std::{
    sync::Weak,
    time::Duration,
};

use chrono::Utc;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::debug;

use livedoc_core::config::TtlIndex;

use crate::table::DocumentTable;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Removes every document for which any index has expired.
///
/// Goes through [`DocumentTable::modify`], so an open batch sees the removal in
/// its staging copy. Returns the number of removed documents.
pub(crate) fn sweep(table: &DocumentTable, indexes: &[TtlIndex], now_ms: i64) -> usize {
    if indexes.is_empty() {
        return 0;
    }

    let removed = table.modify(|docs| {
        let before = docs.len();
        docs.retain(|_, doc| !indexes.iter().any(|index| index.is_expired(doc, now_ms)));
        let removed = before - docs.len();
        (removed, removed > 0)
    });

    if removed > 0 {
        debug!(collection = %table.name(), removed, "expired documents");
    }

    removed
}

/// Spawns the periodic sweeper. The first sweep runs one `every` after start.
///
/// The task only holds a weak reference and exits once the table is gone.
pub(crate) fn spawn(
    handle: &Handle,
    table: Weak<DocumentTable>,
    indexes: Vec<TtlIndex>,
    every: Duration,
) -> JoinHandle<()> {
    let every = every.max(Duration::from_millis(1));

    handle.spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + every, every);

        loop {
            ticker.tick().await;

            let Some(table) = table.upgrade() else {
                break;
            };
            sweep(&table, &indexes, now_ms());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::Arc;

    fn table_with(docs: Vec<bson::Document>) -> Arc<DocumentTable> {
        let table = Arc::new(DocumentTable::new("sessions"));
        table.modify(|map| {
            for doc in docs {
                let id = doc.get_str("id").unwrap_or_default().to_string();
                map.insert(id, Arc::new(doc));
            }
            ((), true)
        });
        table
    }

    #[test]
    fn any_expired_index_evicts() {
        let table = table_with(vec![
            doc! { "id": "a", "created": 0_i64, "seen": 9_000_i64 },
            doc! { "id": "b", "created": 9_000_i64, "seen": 9_000_i64 },
            doc! { "id": "c", "created": "yesterday" },
        ]);
        let indexes = [TtlIndex::new("created", 5), TtlIndex::new("seen", 60)];

        assert_eq!(sweep(&table, &indexes, 10_000), 1);
        assert_eq!(table.snapshot().docs.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn empty_sweeps_keep_the_version() {
        let table = table_with(vec![doc! { "id": "a", "created": 0_i64 }]);
        let version = table.version();

        assert_eq!(sweep(&table, &[TtlIndex::new("created", 60)], 1_000), 0);
        assert_eq!(table.version(), version);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_ticks_after_one_interval() {
        let table = table_with(vec![doc! { "id": "a", "created": now_ms() - 10_000 }]);
        let task = spawn(
            &Handle::current(),
            Arc::downgrade(&table),
            vec![TtlIndex::new("created", 5)],
            Duration::from_secs(30),
        );

        time::sleep(Duration::from_secs(29)).await;
        assert_eq!(table.snapshot().docs.len(), 1);

        time::sleep(Duration::from_secs(2)).await;
        assert!(table.snapshot().docs.is_empty());

        task.abort();
    }
}
