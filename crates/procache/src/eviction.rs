//! # Eviction
//!
//! Keeps a store within its [`CacheBudget`] by removing the least valuable
//! entries first. Entries that are leased by a reader are skipped and only
//! retried once every other candidate has been considered.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{CacheBudget, EvictionOrder};
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, CacheEventSink};
use crate::store::{CacheStore, EntryInfo, Eviction};

/// Summary of one enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed_bytes: u64,
    /// Leased entries that had to stay in place
    pub pending: usize,
    pub within_budget: bool,
}

impl EvictionReport {
    /// Turn a pass that could not reach the budget into an error.
    pub fn into_result(self) -> CacheResult<Self> {
        if self.within_budget {
            Ok(self)
        } else {
            Err(CacheError::BudgetEnforcementFailed {
                pending: self.pending,
            })
        }
    }
}

impl EvictionOrder {
    /// Sort candidates so the first one is evicted first.
    pub fn sort(&self, entries: &mut [EntryInfo]) {
        match self {
            Self::LeastRecentlyUsed => entries.sort_by(|a, b| {
                a.last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.inserted_seq.cmp(&b.inserted_seq))
            }),
            Self::InsertionOrder => entries.sort_by_key(|e| e.inserted_seq),
        }
    }
}

pub struct EvictionManager {
    order: EvictionOrder,
    sink: Arc<dyn CacheEventSink>,
    /// Serializes passes; readers and writers never take it
    pass: Mutex<()>,
}

impl EvictionManager {
    pub fn new(order: EvictionOrder, sink: Arc<dyn CacheEventSink>) -> Self {
        Self {
            order,
            sink,
            pass: Mutex::new(()),
        }
    }

    /// Evict entries until `store` fits `budget`. A store that already fits
    /// is left untouched.
    pub async fn enforce_budget<S>(&self, store: &S, budget: &CacheBudget) -> EvictionReport
    where
        S: CacheStore + ?Sized,
    {
        let _pass = self.pass.lock().await;
        let mut report = EvictionReport::default();

        if !over_budget(store, budget) {
            report.within_budget = true;
            return report;
        }

        let mut candidates: Vec<EntryInfo> = store.iterate().collect();
        self.order.sort(&mut candidates);

        let mut deferred = Vec::new();
        for entry in candidates {
            if !over_budget(store, budget) {
                break;
            }
            if entry.leased {
                deferred.push(entry);
                continue;
            }
            if self.try_evict(store, &entry, &mut report).await == Some(Eviction::Leased) {
                deferred.push(entry);
            }
        }

        for entry in deferred {
            if !over_budget(store, budget) {
                break;
            }
            if self.try_evict(store, &entry, &mut report).await == Some(Eviction::Leased) {
                report.pending += 1;
                self.sink.on_event(CacheEvent::EvictionDeferred { key: entry.key });
            }
        }

        report.within_budget = !over_budget(store, budget);
        if !report.within_budget {
            self.sink.on_event(CacheEvent::BudgetEnforcementFailed {
                pending: report.pending,
            });
        }

        debug!(
            evicted = report.evicted,
            freed_bytes = report.freed_bytes,
            pending = report.pending,
            size_bytes = store.size_bytes(),
            entries = store.entry_count(),
            "Eviction pass finished"
        );
        report
    }

    async fn try_evict<S>(
        &self,
        store: &S,
        entry: &EntryInfo,
        report: &mut EvictionReport,
    ) -> Option<Eviction>
    where
        S: CacheStore + ?Sized,
    {
        match store.evict(&entry.key).await {
            Ok(eviction) => {
                if let Eviction::Removed { size } = eviction {
                    report.evicted += 1;
                    report.freed_bytes += size;
                    self.sink.on_event(CacheEvent::Evicted {
                        key: entry.key.clone(),
                        size,
                    });
                }
                Some(eviction)
            }
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to evict cache entry");
                None
            }
        }
    }
}

impl std::fmt::Debug for EvictionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionManager")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

fn over_budget<S: CacheStore + ?Sized>(store: &S, budget: &CacheBudget) -> bool {
    budget.is_exceeded_by(store.size_bytes(), store.entry_count())
}
