//! Ingestion driver (C12, ambient): feeds a batch of card ids through the
//! Processor with bounded parallelism, honoring `concurrent_deduplication`.
//! Cards the Processor asks to be requeued (because an eviction changed their
//! match set) are re-enqueued for a later pass.
//!
//! Mirrors this codebase's own file-concurrency helper: chunk the work into
//! groups no larger than the configured limit and run each chunk with rayon,
//! rather than spinning up an unbounded thread-per-card pool.

use crate::config::DedupeConfig;
use crate::context::ProcessOutcome;
use crate::errors::{CardId, DedupeError};
use crate::evidence::EvidenceStore;
use crate::kv::MemoryKvStore;
use crate::processor;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Caps how many times a single card can be requeued before the driver gives
/// up on it, guarding against a pathological cycle of evictions.
const MAX_REQUEUE_PASSES: usize = 64;

#[derive(Debug, Default)]
pub struct IngestReport {
    pub processed: usize,
    pub bucket_sets_touched: usize,
    pub touched_bucket_set_keys: BTreeSet<CardId>,
    pub errors: Vec<(CardId, DedupeError)>,
}

/// Process every card in `card_ids`, feeding Processor-requested requeues
/// back into the queue, bounded by `config.concurrent_deduplication` cards in
/// flight at once.
pub fn ingest(
    store: &MemoryKvStore,
    evidence: &Arc<dyn EvidenceStore>,
    config: &DedupeConfig,
    card_ids: impl IntoIterator<Item = CardId>,
) -> IngestReport {
    let limit = config.concurrent_deduplication.max(1);
    let mut queue: VecDeque<CardId> = card_ids.into_iter().collect();
    let report = Mutex::new(IngestReport::default());
    let mut pass = 0usize;

    while !queue.is_empty() {
        pass += 1;
        let chunk: Vec<CardId> = (0..limit.min(queue.len())).filter_map(|_| queue.pop_front()).collect();
        let requeued: Vec<CardId> = chunk
            .par_iter()
            .flat_map(|&card_id| {
                match processor::process_card(store, evidence, config, card_id) {
                    Ok(ProcessOutcome { updates, requeue, .. }) => {
                        let mut r = report.lock();
                        r.processed += 1;
                        r.bucket_sets_touched += updates.len();
                        r.touched_bucket_set_keys.extend(updates.iter().map(|u| u.bucket_id));
                        drop(r);
                        requeue
                    }
                    Err(e) => {
                        tracing::warn!(card_id, error = %e, "card failed permanently");
                        report.lock().errors.push((card_id, e));
                        Vec::new()
                    }
                }
            })
            .collect();

        if pass <= MAX_REQUEUE_PASSES {
            queue.extend(requeued);
        } else if !requeued.is_empty() {
            tracing::warn!(count = requeued.len(), "dropping requeues after exceeding pass limit");
        }
    }

    report.into_inner()
}
