//! Processor (C9): per-card orchestration. Builds a fresh `Context`, runs the
//! seven-step pipeline from the design notes, and retries the whole unit of
//! work from scratch on an optimistic-lock conflict.

use crate::config::DedupeConfig;
use crate::context::{
    sub_bucket_add_card, sub_bucket_propagate_key, sub_bucket_resolve, sub_bucket_set_matches, Context, ProcessOutcome,
};
use crate::errors::{CardId, DedupeError};
use crate::evidence::EvidenceStore;
use crate::fingerprint::Fingerprint;
use crate::kv::MemoryKvStore;
use crate::matcher;
use crate::model::SubBucket;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Process one card to completion, retrying on `OptimisticConflict` up to
/// `config.max_retries` times (unbounded if `None`).
pub fn process_card(
    store: &MemoryKvStore,
    evidence: &Arc<dyn EvidenceStore>,
    config: &DedupeConfig,
    card_id: CardId,
) -> Result<ProcessOutcome, DedupeError> {
    let mut attempt: usize = 0;
    loop {
        let ctx = Context::new(store.clone(), evidence.clone(), config.clone());
        match run(ctx, card_id) {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_optimistic_conflict() => {
                attempt += 1;
                tracing::warn!(card_id, attempt, "optimistic conflict, retrying card");
                if let Some(max) = config.max_retries {
                    if attempt > max {
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn run(mut ctx: Context, card_id: CardId) -> Result<ProcessOutcome, DedupeError> {
    process_card_once(&mut ctx, card_id)?;
    ctx.finish()
}

fn process_card_once(ctx: &mut Context, card_id: CardId) -> Result<(), DedupeError> {
    // Step 1: reprocess case. The card is already clustered; walk the
    // connected component reachable through matching edges crossing
    // BucketSets and report it without any structural change.
    if let Some(sb_key) = ctx.card_sub_bucket(card_id)? {
        reprocess_walk(ctx, sb_key)?;
        return Ok(());
    }

    // Step 2: fingerprint the new card and find everything it matches.
    let sentences = matcher::sentences_for_card(ctx.evidence(), ctx.config().sentence_cutoff, card_id)?;
    ctx.set_card_length(card_id, sentences.len() as u32);
    let result = matcher::find_matches(ctx, card_id, &sentences)?;

    // Step 3: every SubBucket holding a matched card is a merge candidate;
    // refresh its recorded external match count for this card.
    let mut candidate_keys: BTreeSet<CardId> = BTreeSet::new();
    for &m in &result.matches {
        if let Some(k) = ctx.card_sub_bucket(m)? {
            candidate_keys.insert(k);
        }
    }
    for &k in &candidate_keys {
        sub_bucket_set_matches(ctx, k, card_id, &result.matches)?;
    }

    // Step 4: of the candidates that SHOULD_MATCH, join the largest; failing
    // that, start a fresh singleton SubBucket keyed by the card itself.
    let mut best: Option<(CardId, usize)> = None;
    for &k in &candidate_keys {
        let sb = ctx.get_sub_bucket(k)?;
        if sb.does_bucket_match(&result.matches, ctx.config().should_match_threshold) {
            let size = sb.cards.len();
            if best.map(|(_, s)| size > s).unwrap_or(true) {
                best = Some((k, size));
            }
        }
    }

    let target_key = match best {
        Some((k, _)) => sub_bucket_add_card(ctx, k, card_id, &result.matches)?
            .ok_or_else(|| DedupeError::Infrastructure("SubBucket vanished immediately after addCard".into()))?,
        None => {
            let sb = SubBucket::singleton(card_id, &result.matches);
            let key = sb.key;
            ctx.set_card_sub_bucket(card_id, Some(key));
            ctx.put_sub_bucket(sb);
            sub_bucket_propagate_key(ctx, key)?.unwrap_or(key)
        }
    };

    // Step 5: let the SubBucket (and its BucketSet) resolve around the new
    // arrival.
    sub_bucket_resolve(ctx, target_key, &result.matches)?;

    // Step 6: record this card's sentences in the SentenceIndex, unless they
    // were already present (a reprocess of identical text under a new id).
    if !result.existing_sentences {
        let bucket_key_bits = ctx.config().bucket_key_bits();
        for (i, sentence) in sentences.iter().enumerate() {
            let fp = Fingerprint::of(sentence, bucket_key_bits);
            ctx.add_sentence_occurrence(fp, card_id, i as u16)?;
        }
    }

    Ok(())
}

/// Read-only BFS over the BucketSet graph reachable from `start_sb_key`
/// through `matching` edges that cross BucketSet boundaries. Marks every
/// visited BucketSet touched (for reporting) without mutating anything.
fn reprocess_walk(ctx: &mut Context, start_sb_key: CardId) -> Result<(), DedupeError> {
    let start_bs = ctx.get_sub_bucket(start_sb_key)?.bucket_set_id;
    let mut seen_bs: BTreeSet<CardId> = BTreeSet::new();
    seen_bs.insert(start_bs);
    let mut queue = vec![start_bs];

    while let Some(bs_key) = queue.pop() {
        ctx.mark_bucket_set_touched(bs_key);
        let bs = ctx.get_bucket_set(bs_key)?;
        for sb_key in bs.sub_bucket_ids.clone() {
            let sb = ctx.get_sub_bucket(sb_key)?;
            for m in sb.matching.keys().copied().collect::<Vec<_>>() {
                if let Some(m_sb_key) = ctx.card_sub_bucket(m)? {
                    let m_bs_key = ctx.get_sub_bucket(m_sb_key)?.bucket_set_id;
                    if seen_bs.insert(m_bs_key) {
                        queue.push(m_bs_key);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::InMemoryEvidenceStore;

    fn setup(rows: &[(CardId, &str)]) -> (MemoryKvStore, Arc<dyn EvidenceStore>) {
        let store = MemoryKvStore::new();
        let evidence = InMemoryEvidenceStore::new();
        for (id, text) in rows {
            evidence.insert(*id, *text);
        }
        (store, Arc::new(evidence))
    }

    const SAMPLE: &str = "This is a sufficiently long sentence for the cutoff. \
It continues on with more substantial filler text here. \
And a third sentence rounds out the paragraph nicely.";

    #[test]
    fn first_card_becomes_an_unreported_singleton() {
        let (store, evidence) = setup(&[(1, SAMPLE)]);
        let config = DedupeConfig::default();
        let outcome = process_card(&store, &evidence, &config, 1).unwrap();
        assert!(outcome.updates.is_empty());
        assert!(outcome.deletes.is_empty());
    }

    #[test]
    fn two_near_duplicate_cards_cluster_into_one_reported_bucket_set() {
        let (store, evidence) = setup(&[(1, SAMPLE), (2, SAMPLE)]);
        let config = DedupeConfig::default();
        process_card(&store, &evidence, &config, 1).unwrap();
        let outcome = process_card(&store, &evidence, &config, 2).unwrap();
        assert_eq!(outcome.updates.len(), 1);
        let summary = &outcome.updates[0];
        assert_eq!(summary.card_ids, vec![1, 2]);
    }

    #[test]
    fn unrelated_cards_never_cluster() {
        let (store, evidence) = setup(&[
            (1, SAMPLE),
            (2, "A completely unrelated paragraph about something else entirely today."),
        ]);
        let config = DedupeConfig::default();
        process_card(&store, &evidence, &config, 1).unwrap();
        let outcome = process_card(&store, &evidence, &config, 2).unwrap();
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn reprocessing_an_already_clustered_card_is_a_no_op_structurally() {
        let (store, evidence) = setup(&[(1, SAMPLE), (2, SAMPLE)]);
        let config = DedupeConfig::default();
        process_card(&store, &evidence, &config, 1).unwrap();
        process_card(&store, &evidence, &config, 2).unwrap();
        let outcome = process_card(&store, &evidence, &config, 1).unwrap();
        assert!(outcome.deletes.is_empty());
    }
}
