//! Context (C8): the per-card unit of work. Owns a `Transaction`, caches every
//! entity it touches keyed by its *current* logical key, and tracks which
//! entities are dirty, deleted, or renamed so `finish()` can save them in the
//! fixed order the spec requires: SubBucket, CardLength, CardSubBucket,
//! Sentence, BucketSet.
//!
//! SubBucket and BucketSet are plain data (`model.rs`); the algorithms that
//! mutate the entity graph (`addCard`, `resolve`, `merge`, `propagateKey`, ...)
//! are free functions here that take `&mut Context` and an entity key, rather
//! than methods recursively borrowing `self` — the graph's cross-references
//! are logical keys, not pointers, precisely so this is possible.

use crate::config::DedupeConfig;
use crate::errors::{CardId, DedupeError};
use crate::evidence::EvidenceStore;
use crate::fingerprint::Fingerprint;
use crate::kv::{MemoryKvStore, Transaction};
use crate::matcher;
use crate::model::{should_merge_sets, BucketSet, CardSet, SubBucket};
use crate::sentence_index::SentenceIndex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// The report a completed unit of work hands back to the `Processor`/driver:
/// which BucketSets changed shape (and their current card membership), which
/// BucketSet keys were retired, and which cards should be re-enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub updates: Vec<BucketSetSummary>,
    pub deletes: Vec<CardId>,
    pub requeue: Vec<CardId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSetSummary {
    pub bucket_id: CardId,
    pub card_ids: Vec<CardId>,
}

pub struct Context {
    config: DedupeConfig,
    tx: Transaction,
    evidence: Arc<dyn EvidenceStore>,
    sentence_index: SentenceIndex,

    sub_buckets: HashMap<CardId, SubBucket>,
    sub_bucket_dirty: HashSet<CardId>,
    sub_bucket_deleted: HashSet<CardId>,

    bucket_sets: HashMap<CardId, BucketSet>,
    bucket_set_dirty: HashSet<CardId>,
    bucket_set_deleted: HashSet<CardId>,
    bucket_set_touched: HashSet<CardId>,

    card_lengths: HashMap<CardId, u32>,
    card_length_dirty: HashSet<CardId>,

    card_sub_bucket: HashMap<CardId, Option<CardId>>,
    card_sub_bucket_dirty: HashSet<CardId>,

    requeue: Vec<CardId>,
}

impl Context {
    pub fn new(store: MemoryKvStore, evidence: Arc<dyn EvidenceStore>, config: DedupeConfig) -> Self {
        let sentence_index = SentenceIndex::new(config.key_prefix.clone());
        Self {
            tx: store.begin(),
            sentence_index,
            evidence,
            config,
            sub_buckets: HashMap::new(),
            sub_bucket_dirty: HashSet::new(),
            sub_bucket_deleted: HashSet::new(),
            bucket_sets: HashMap::new(),
            bucket_set_dirty: HashSet::new(),
            bucket_set_deleted: HashSet::new(),
            bucket_set_touched: HashSet::new(),
            card_lengths: HashMap::new(),
            card_length_dirty: HashSet::new(),
            card_sub_bucket: HashMap::new(),
            card_sub_bucket_dirty: HashSet::new(),
            requeue: Vec::new(),
        }
    }

    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    pub fn evidence(&self) -> &dyn EvidenceStore {
        self.evidence.as_ref()
    }

    fn sb_key(&self, key: CardId) -> String {
        format!("{}SB:{}", self.config.key_prefix, key)
    }

    fn bs_key(&self, key: CardId) -> String {
        format!("{}BS:{}", self.config.key_prefix, key)
    }

    fn card_key(&self, id: CardId) -> String {
        format!("{}C:{}", self.config.key_prefix, id)
    }

    pub fn requeue(&mut self, card_id: CardId) {
        self.requeue.push(card_id);
    }

    // -- CardLength ---------------------------------------------------------

    pub fn card_length(&mut self, id: CardId) -> Result<u32, DedupeError> {
        if let Some(v) = self.card_lengths.get(&id) {
            return Ok(*v);
        }
        let key = self.card_key(id);
        let val = self.tx.get_hash_field(&key, "l").and_then(|s| s.parse().ok()).unwrap_or(0);
        self.card_lengths.insert(id, val);
        Ok(val)
    }

    pub fn set_card_length(&mut self, id: CardId, len: u32) {
        self.card_lengths.insert(id, len);
        self.card_length_dirty.insert(id);
    }

    // -- CardSubBucket --------------------------------------------------------

    pub fn card_sub_bucket(&mut self, id: CardId) -> Result<Option<CardId>, DedupeError> {
        if let Some(v) = self.card_sub_bucket.get(&id) {
            return Ok(*v);
        }
        let key = self.card_key(id);
        let val = self.tx.get_hash_field(&key, "sb").and_then(|s| s.parse().ok());
        self.card_sub_bucket.insert(id, val);
        Ok(val)
    }

    pub fn set_card_sub_bucket(&mut self, id: CardId, sb_key: Option<CardId>) {
        self.card_sub_bucket.insert(id, sb_key);
        self.card_sub_bucket_dirty.insert(id);
    }

    // -- Sentence occurrences -------------------------------------------------

    pub fn sentence_occurrences(&mut self, fp: Fingerprint) -> Result<Vec<(CardId, u16)>, DedupeError> {
        self.sentence_index.occurrences_for(&mut self.tx, fp)
    }

    pub fn add_sentence_occurrence(&mut self, fp: Fingerprint, card_id: CardId, sentence_index: u16) -> Result<(), DedupeError> {
        self.sentence_index.add_occurrence(&mut self.tx, fp, card_id, sentence_index)
    }

    // -- SubBucket repository -------------------------------------------------

    fn load_sub_bucket(&mut self, key: CardId) -> Result<(), DedupeError> {
        if self.sub_buckets.contains_key(&key) {
            return Ok(());
        }
        // A key already renamed/deleted away earlier in this same unit of work
        // is logically free; if it's being looked up again it's because some
        // other SubBucket just got re-homed under this same numeric key (keys
        // are card ids, so collisions with an entity just vacated happen). The
        // backing store still holds the old occupant's pre-transaction bytes,
        // so treat the key as a fresh singleton rather than resurrecting them.
        if self.sub_bucket_deleted.contains(&key) {
            self.sub_buckets.insert(key, SubBucket::singleton(key, &[]));
            return Ok(());
        }
        let k = self.sb_key(key);
        let hash = self.tx.get_hash_all(&k);
        let sb = SubBucket::from_hash(key, &hash)?;
        self.sub_buckets.insert(key, sb);
        Ok(())
    }

    pub fn get_sub_bucket(&mut self, key: CardId) -> Result<SubBucket, DedupeError> {
        self.load_sub_bucket(key)?;
        Ok(self.sub_buckets.get(&key).cloned().unwrap())
    }

    pub fn put_sub_bucket(&mut self, sb: SubBucket) {
        let key = sb.key;
        let bucket_set_id = sb.bucket_set_id;
        self.sub_buckets.insert(key, sb);
        self.sub_bucket_dirty.insert(key);
        self.bucket_set_touched.insert(bucket_set_id);
    }

    fn delete_sub_bucket(&mut self, key: CardId) {
        self.sub_buckets.remove(&key);
        self.sub_bucket_dirty.remove(&key);
        self.sub_bucket_deleted.insert(key);
    }

    fn rename_sub_bucket(&mut self, old: CardId, new: CardId) {
        if old == new {
            return;
        }
        if let Some(mut sb) = self.sub_buckets.remove(&old) {
            sb.key = new;
            self.sub_buckets.insert(new, sb);
        }
        self.sub_bucket_dirty.remove(&old);
        self.sub_bucket_deleted.insert(old);
        self.sub_bucket_dirty.insert(new);
    }

    // -- BucketSet repository -------------------------------------------------

    fn load_bucket_set(&mut self, key: CardId) -> Result<(), DedupeError> {
        if self.bucket_sets.contains_key(&key) {
            return Ok(());
        }
        // Same key-recycling hazard as `load_sub_bucket`: a BucketSet key
        // already renamed/deleted away this transaction is free for reuse
        // (e.g. a SubBucket re-homed as its own singleton BucketSet keyed by
        // its own id), so don't resurrect the old occupant's committed state.
        if self.bucket_set_deleted.contains(&key) {
            self.bucket_sets.insert(key, BucketSet::singleton(key));
            return Ok(());
        }
        let k = self.bs_key(key);
        let members = self.tx.get_set_members(&k);
        let bs = if members.is_empty() { BucketSet::singleton(key) } else { BucketSet::from_set(key, &members)? };
        self.bucket_sets.insert(key, bs);
        Ok(())
    }

    pub fn get_bucket_set(&mut self, key: CardId) -> Result<BucketSet, DedupeError> {
        self.load_bucket_set(key)?;
        Ok(self.bucket_sets.get(&key).cloned().unwrap())
    }

    pub fn put_bucket_set(&mut self, bs: BucketSet) {
        let key = bs.key;
        self.bucket_sets.insert(key, bs);
        self.bucket_set_dirty.insert(key);
        self.bucket_set_touched.insert(key);
    }

    fn delete_bucket_set(&mut self, key: CardId) {
        self.bucket_sets.remove(&key);
        self.bucket_set_dirty.remove(&key);
        self.bucket_set_deleted.insert(key);
        self.bucket_set_touched.remove(&key);
    }

    fn rename_bucket_set(&mut self, old: CardId, new: CardId) {
        if old == new {
            return;
        }
        if let Some(mut bs) = self.bucket_sets.remove(&old) {
            bs.key = new;
            self.bucket_sets.insert(new, bs);
        }
        self.bucket_set_dirty.remove(&old);
        self.bucket_set_deleted.insert(old);
        self.bucket_set_dirty.insert(new);
        self.bucket_set_touched.remove(&old);
        self.bucket_set_touched.insert(new);
    }

    pub fn mark_bucket_set_touched(&mut self, key: CardId) {
        self.bucket_set_touched.insert(key);
    }

    /// Save every dirty entity in the fixed order the spec mandates, then
    /// perform the compare-and-swap commit. On success, reports the BucketSets
    /// touched during this unit of work and the cards that should be requeued.
    pub fn finish(mut self) -> Result<ProcessOutcome, DedupeError> {
        // 1. SubBucket
        let deleted_sbs: Vec<CardId> = self.sub_bucket_deleted.iter().copied().collect();
        for key in deleted_sbs {
            let k = self.sb_key(key);
            self.tx.delete_key(&k);
        }
        let dirty_sbs: Vec<CardId> = self.sub_bucket_dirty.iter().copied().collect();
        for key in dirty_sbs {
            if let Some(sb) = self.sub_buckets.get(&key).cloned() {
                let k = self.sb_key(key);
                self.tx.replace_hash(&k, sb.to_hash());
            }
        }

        // 2. CardLength
        let dirty_lengths: Vec<CardId> = self.card_length_dirty.iter().copied().collect();
        for id in dirty_lengths {
            let len = *self.card_lengths.get(&id).unwrap();
            let k = self.card_key(id);
            self.tx.set_hash_field(&k, "l", len.to_string());
        }

        // 3. CardSubBucket
        let dirty_csb: Vec<CardId> = self.card_sub_bucket_dirty.iter().copied().collect();
        for id in dirty_csb {
            let k = self.card_key(id);
            match self.card_sub_bucket.get(&id).copied().flatten() {
                Some(sb_key) => self.tx.set_hash_field(&k, "sb", sb_key.to_string()),
                None => self.tx.delete_hash_field(&k, "sb"),
            }
        }

        // 4. Sentence: occurrences are appended directly to the transaction as
        // they're discovered, so there is nothing further to save here.

        // 5. BucketSet
        let deleted_bss: Vec<CardId> = self.bucket_set_deleted.iter().copied().collect();
        for key in &deleted_bss {
            let k = self.bs_key(*key);
            self.tx.delete_key(&k);
        }
        let dirty_bss: Vec<CardId> = self.bucket_set_dirty.iter().copied().collect();
        for key in dirty_bss {
            if let Some(bs) = self.bucket_sets.get(&key).cloned() {
                let k = self.bs_key(key);
                if bs.is_persisted() {
                    self.tx.replace_set(&k, bs.to_set());
                } else {
                    // Singleton BucketSets are reconstructed on load, never persisted.
                    self.tx.delete_key(&k);
                }
            }
        }

        let mut updates = Vec::new();
        for bs_key in &self.bucket_set_touched {
            if let Some(bs) = self.bucket_sets.get(bs_key) {
                let mut card_ids = Vec::new();
                for sb_key in &bs.sub_bucket_ids {
                    if let Some(sb) = self.sub_buckets.get(sb_key) {
                        card_ids.extend(sb.cards.keys().copied());
                    }
                }
                // A cluster of exactly one card is not a duplicate cluster; skip it
                // rather than reporting every untouched singleton as an "update".
                if card_ids.len() > 1 {
                    card_ids.sort_unstable();
                    updates.push(BucketSetSummary { bucket_id: *bs_key, card_ids });
                }
            }
        }
        updates.sort_by_key(|u| u.bucket_id);
        let mut deletes = deleted_bss;
        deletes.sort_unstable();
        let requeue = self.requeue.clone();

        self.tx.commit()?;
        Ok(ProcessOutcome { updates, deletes, requeue })
    }
}

// ---------------------------------------------------------------------------
// SubBucket algorithms (spec §4.4). Each returns the operated-on entity's
// current key, or `None` if the operation left it empty and thus deleted.
// ---------------------------------------------------------------------------

/// `addCard`: insert `card_id` into the SubBucket at `sb_key`, incrementing
/// internal match counts against every already-member of `external_matches`
/// and external match counts against the rest.
pub(crate) fn sub_bucket_add_card(
    ctx: &mut Context,
    sb_key: CardId,
    card_id: CardId,
    external_matches: &[CardId],
) -> Result<Option<CardId>, DedupeError> {
    let mut sb = ctx.get_sub_bucket(sb_key)?;
    if sb.cards.contains_key(&card_id) {
        tracing::warn!(card_id, sub_bucket = sb.key, "card already in bucket");
        return Ok(Some(sb.key));
    }
    sb.matching.remove(&card_id);
    sb.cards.insert(card_id, 1);
    for m in external_matches {
        if sb.cards.contains_key(m) {
            *sb.cards.get_mut(&card_id).unwrap() += 1;
            *sb.cards.get_mut(m).unwrap() += 1;
        } else {
            *sb.matching.entry(*m).or_insert(0) += 1;
        }
    }
    ctx.set_card_sub_bucket(card_id, Some(sb.key));
    ctx.put_sub_bucket(sb);
    sub_bucket_propagate_key(ctx, sb_key)
}

/// `setMatches`: overwrite the non-member `card_id`'s external match count
/// with its fresh overlap against current members.
pub(crate) fn sub_bucket_set_matches(
    ctx: &mut Context,
    sb_key: CardId,
    card_id: CardId,
    external_matches: &[CardId],
) -> Result<(), DedupeError> {
    let mut sb = ctx.get_sub_bucket(sb_key)?;
    let overlap = external_matches.iter().filter(|c| sb.cards.contains_key(c)).count() as u32;
    if overlap > 0 {
        sb.matching.insert(card_id, overlap);
    } else {
        sb.matching.remove(&card_id);
    }
    ctx.put_sub_bucket(sb);
    Ok(())
}

/// `removeCard`: evict `card_id`, re-derive its matches via the Matcher
/// against the whole SentenceIndex, and decrement whichever counters the
/// remaining members had recorded against it.
pub(crate) fn sub_bucket_remove_card(ctx: &mut Context, sb_key: CardId, card_id: CardId) -> Result<Option<CardId>, DedupeError> {
    let mut sb = ctx.get_sub_bucket(sb_key)?;
    sb.cards.remove(&card_id);
    ctx.set_card_sub_bucket(card_id, None);

    let sentences = matcher::sentences_for_card(ctx.evidence(), ctx.config().sentence_cutoff, card_id)?;
    let result = matcher::find_matches(ctx, card_id, &sentences)?;
    for m in &result.matches {
        if let Some(count) = sb.cards.get_mut(m) {
            *count -= 1;
            if *count == 0 {
                sb.cards.remove(m);
            }
        } else if let Some(count) = sb.matching.get_mut(m) {
            *count -= 1;
            if *count == 0 {
                sb.matching.remove(m);
            }
        }
    }
    ctx.put_sub_bucket(sb);
    ctx.requeue(card_id);
    sub_bucket_propagate_key(ctx, sb_key)
}

/// `propagateKey`: if the SubBucket is now empty, remove it from its
/// BucketSet and delete it. Otherwise rename it (and every member's
/// back-reference) to `min(cards.keys)` if that differs from the current key.
pub(crate) fn sub_bucket_propagate_key(ctx: &mut Context, sb_key: CardId) -> Result<Option<CardId>, DedupeError> {
    let sb = ctx.get_sub_bucket(sb_key)?;
    if sb.is_empty() {
        bucket_set_drop_member(ctx, sb.bucket_set_id, sb_key)?;
        ctx.delete_sub_bucket(sb_key);
        return Ok(None);
    }
    let new_key = sb.min_card().unwrap();
    if new_key != sb_key {
        bucket_set_rename_sub_bucket(ctx, sb.bucket_set_id, sb_key, new_key)?;
        ctx.rename_sub_bucket(sb_key, new_key);
        for id in sb.cards.keys().copied() {
            ctx.set_card_sub_bucket(id, Some(new_key));
        }
        return Ok(Some(new_key));
    }
    Ok(Some(sb_key))
}

/// `resolveRemoves`: repeatedly evict the first member violating SHOULD_MATCH
/// until none remain (or the bucket empties out).
fn sub_bucket_resolve_removes(ctx: &mut Context, sb_key: CardId) -> Result<(bool, Option<CardId>), DedupeError> {
    let mut sb_key = sb_key;
    let mut removed_any = false;
    loop {
        let sb = ctx.get_sub_bucket(sb_key)?;
        if sb.is_empty() {
            return Ok((removed_any, None));
        }
        match sb.first_should_match_violation(ctx.config().should_match_threshold) {
            Some(bad) => {
                removed_any = true;
                match sub_bucket_remove_card(ctx, sb_key, bad)? {
                    Some(new_key) => sb_key = new_key,
                    None => return Ok((removed_any, None)),
                }
            }
            None => return Ok((removed_any, Some(sb_key))),
        }
    }
}

/// `resolveUpdates(candidates)`: for every candidate card not already a
/// member, find its SubBucket's BucketSet; if that BucketSet and this one
/// together satisfy SHOULD_MERGE, merge them and recurse against the
/// now-larger `matching` set.
fn sub_bucket_resolve_updates(ctx: &mut Context, sb_key: CardId, candidates: &[CardId]) -> Result<Option<CardId>, DedupeError> {
    let sb = ctx.get_sub_bucket(sb_key)?;
    if sb.is_empty() {
        return Ok(None);
    }
    let this_bs_key = sb.bucket_set_id;

    let mut foreign_bs_keys: BTreeSet<CardId> = BTreeSet::new();
    for &cand in candidates {
        if sb.cards.contains_key(&cand) {
            continue;
        }
        if let Some(cand_sb_key) = ctx.card_sub_bucket(cand)? {
            if cand_sb_key == sb_key {
                continue;
            }
            let cand_sb = ctx.get_sub_bucket(cand_sb_key)?;
            if cand_sb.bucket_set_id != this_bs_key {
                foreign_bs_keys.insert(cand_sb.bucket_set_id);
            }
        }
    }

    for foreign_key in foreign_bs_keys {
        let this_bs = ctx.get_bucket_set(this_bs_key)?;
        let foreign_bs = ctx.get_bucket_set(foreign_key)?;
        if this_bs.key == foreign_bs.key {
            continue;
        }
        let this_sbs: Vec<SubBucket> = this_bs.sub_bucket_ids.iter().map(|&k| ctx.get_sub_bucket(k)).collect::<Result<_, _>>()?;
        let foreign_sbs: Vec<SubBucket> =
            foreign_bs.sub_bucket_ids.iter().map(|&k| ctx.get_sub_bucket(k)).collect::<Result<_, _>>()?;
        let a = CardSet::from_sub_buckets(this_sbs.iter());
        let b = CardSet::from_sub_buckets(foreign_sbs.iter());
        if should_merge_sets(&a, &b, ctx.config().should_merge_ratio, ctx.config().should_merge_absolute) {
            bucket_set_merge(ctx, this_bs_key, foreign_key)?;
            let sb_now = ctx.get_sub_bucket(sb_key)?;
            let new_candidates: Vec<CardId> = sb_now.matching.keys().copied().collect();
            return sub_bucket_resolve_updates(ctx, sb_key, &new_candidates);
        }
    }
    Ok(Some(sb_key))
}

/// `resolve`: the entry point invoked after a card lands in a SubBucket.
/// Runs resolveRemoves, lets the owning BucketSet resolve itself, then
/// resolveUpdates against either the full `matching` set (if anything changed
/// upstream) or just the cards named in `updates`, and finally propagates key.
pub(crate) fn sub_bucket_resolve(ctx: &mut Context, sb_key: CardId, updates: &[CardId]) -> Result<Option<CardId>, DedupeError> {
    let (removed_any, sb_key) = sub_bucket_resolve_removes(ctx, sb_key)?;
    let sb_key = match sb_key {
        Some(k) => k,
        None => return Ok(None),
    };

    let sb = ctx.get_sub_bucket(sb_key)?;
    let bs_key = sb.bucket_set_id;
    let (bs_changed, _) = bucket_set_resolve(ctx, bs_key)?;

    let sb = ctx.get_sub_bucket(sb_key)?;
    if sb.is_empty() {
        return Ok(None);
    }
    let matching_keys: Vec<CardId> = sb.matching.keys().copied().collect();
    let candidates: Vec<CardId> = if removed_any || bs_changed {
        matching_keys
    } else {
        let updates_set: HashSet<CardId> = updates.iter().copied().collect();
        matching_keys.into_iter().filter(|k| updates_set.contains(k)).collect()
    };

    match sub_bucket_resolve_updates(ctx, sb_key, &candidates)? {
        Some(k) => sub_bucket_propagate_key(ctx, k),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// BucketSet algorithms (spec §4.5).
// ---------------------------------------------------------------------------

/// Remove `sb_key` from `bs_key`'s membership and propagate the BucketSet's
/// key. Used both when a SubBucket is destroyed outright (empty) and as the
/// first step of evicting a still-alive SubBucket during `resolve`.
fn bucket_set_drop_member(ctx: &mut Context, bs_key: CardId, sb_key: CardId) -> Result<Option<CardId>, DedupeError> {
    let mut bs = ctx.get_bucket_set(bs_key)?;
    bs.sub_bucket_ids.remove(&sb_key);
    ctx.put_bucket_set(bs);
    bucket_set_propagate_key(ctx, bs_key)
}

/// Move `sb_key` to `new_sb_key` inside `bs_key`'s membership (a SubBucket
/// rename) and propagate the BucketSet's key.
fn bucket_set_rename_sub_bucket(ctx: &mut Context, bs_key: CardId, old_sb_key: CardId, new_sb_key: CardId) -> Result<Option<CardId>, DedupeError> {
    let mut bs = ctx.get_bucket_set(bs_key)?;
    bs.sub_bucket_ids.remove(&old_sb_key);
    bs.sub_bucket_ids.insert(new_sb_key);
    ctx.put_bucket_set(bs);
    bucket_set_propagate_key(ctx, bs_key)
}

/// `propagateKey`: if now empty, delete the BucketSet. Otherwise rename it
/// (and every member SubBucket's `bucketSetId`) to `min(subBucketIds)` if that
/// differs from the current key.
fn bucket_set_propagate_key(ctx: &mut Context, bs_key: CardId) -> Result<Option<CardId>, DedupeError> {
    let bs = ctx.get_bucket_set(bs_key)?;
    if bs.sub_bucket_ids.is_empty() {
        ctx.delete_bucket_set(bs_key);
        return Ok(None);
    }
    let new_key = bs.min_sub_bucket().unwrap();
    if new_key != bs_key {
        ctx.rename_bucket_set(bs_key, new_key);
        for sid in bs.sub_bucket_ids.iter().copied() {
            let mut sb = ctx.get_sub_bucket(sid)?;
            sb.bucket_set_id = new_key;
            ctx.put_sub_bucket(sb);
        }
        ctx.mark_bucket_set_touched(new_key);
        return Ok(Some(new_key));
    }
    ctx.mark_bucket_set_touched(bs_key);
    Ok(Some(bs_key))
}

/// `removeSubBucket`: evict a still-alive SubBucket from `bs_key`, re-home it
/// as its own singleton BucketSet, and let it try to resolveUpdates against
/// whatever it still matches outside its old set.
fn bucket_set_remove_sub_bucket(ctx: &mut Context, bs_key: CardId, sb_key: CardId) -> Result<Option<CardId>, DedupeError> {
    let new_bs_key = bucket_set_drop_member(ctx, bs_key, sb_key)?;
    let mut sb = ctx.get_sub_bucket(sb_key)?;
    sb.bucket_set_id = sb_key;
    let candidates: Vec<CardId> = sb.matching.keys().copied().collect();
    ctx.put_sub_bucket(sb);
    sub_bucket_resolve_updates(ctx, sb_key, &candidates)?;
    Ok(new_bs_key)
}

/// `merge`: fold `other_key`'s membership into `this_key`, reassign every
/// moved SubBucket's `bucketSetId`, then propagate key. `this_key` survives
/// (possibly renamed); `other_key` is always deleted.
pub(crate) fn bucket_set_merge(ctx: &mut Context, this_key: CardId, other_key: CardId) -> Result<Option<CardId>, DedupeError> {
    if this_key == other_key {
        return Ok(Some(this_key));
    }
    let mut this_bs = ctx.get_bucket_set(this_key)?;
    let other_bs = ctx.get_bucket_set(other_key)?;
    this_bs.sub_bucket_ids.extend(other_bs.sub_bucket_ids.iter().copied());
    let member_ids: Vec<CardId> = this_bs.sub_bucket_ids.iter().copied().collect();
    ctx.put_bucket_set(this_bs);
    ctx.delete_bucket_set(other_key);
    for sid in member_ids {
        let mut sb = ctx.get_sub_bucket(sid)?;
        if sb.bucket_set_id != this_key {
            sb.bucket_set_id = this_key;
            ctx.put_sub_bucket(sb);
        }
    }
    bucket_set_propagate_key(ctx, this_key)
}

/// `resolve`: repeatedly find a member SubBucket whose removal would leave
/// the rest still satisfying SHOULD_MERGE against it; evict the first such
/// straggler and repeat until the set is internally cohesive or a singleton.
/// Returns whether anything was evicted and the set's current key.
fn bucket_set_resolve(ctx: &mut Context, bs_key: CardId) -> Result<(bool, Option<CardId>), DedupeError> {
    let mut bs_key = bs_key;
    let mut removed_any = false;
    loop {
        let bs = ctx.get_bucket_set(bs_key)?;
        if bs.sub_bucket_ids.len() <= 1 {
            return Ok((removed_any, Some(bs_key)));
        }
        let ids: Vec<CardId> = bs.sub_bucket_ids.iter().copied().collect();
        let mut evict = None;
        for &candidate in &ids {
            let mut others = Vec::with_capacity(ids.len() - 1);
            for &id in &ids {
                if id != candidate {
                    others.push(ctx.get_sub_bucket(id)?);
                }
            }
            let candidate_sb = ctx.get_sub_bucket(candidate)?;
            let rest = CardSet::from_sub_buckets(others.iter());
            let member = CardSet::from_sub_buckets(std::iter::once(&candidate_sb));
            if !should_merge_sets(&rest, &member, ctx.config().should_merge_ratio, ctx.config().should_merge_absolute) {
                evict = Some(candidate);
                break;
            }
        }
        match evict {
            Some(id) => {
                removed_any = true;
                match bucket_set_remove_sub_bucket(ctx, bs_key, id)? {
                    Some(new_key) => bs_key = new_key,
                    None => return Ok((removed_any, None)),
                }
            }
            None => return Ok((removed_any, Some(bs_key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupeConfig;
    use crate::evidence::InMemoryEvidenceStore;
    use crate::kv::MemoryKvStore;

    fn new_ctx(store: &MemoryKvStore, evidence: &Arc<InMemoryEvidenceStore>) -> Context {
        Context::new(store.clone(), evidence.clone(), DedupeConfig::default())
    }

    #[test]
    fn new_card_with_no_matches_becomes_its_own_singleton() {
        let store = MemoryKvStore::new();
        let evidence: Arc<InMemoryEvidenceStore> = Arc::new(InMemoryEvidenceStore::new());
        let mut ctx = new_ctx(&store, &evidence);

        let sb = SubBucket::singleton(1, &[]);
        ctx.set_card_sub_bucket(1, Some(1));
        ctx.put_sub_bucket(sb);
        let outcome = ctx.finish().unwrap();
        assert_eq!(outcome.updates.len(), 0); // singleton BucketSet, never persisted/reported
    }

    #[test]
    fn add_card_increments_internal_matches_for_existing_members() {
        let store = MemoryKvStore::new();
        let evidence: Arc<InMemoryEvidenceStore> = Arc::new(InMemoryEvidenceStore::new());
        let mut ctx = new_ctx(&store, &evidence);

        let sb = SubBucket::singleton(1, &[]);
        ctx.set_card_sub_bucket(1, Some(1));
        ctx.put_sub_bucket(sb);

        let new_key = sub_bucket_add_card(&mut ctx, 1, 2, &[1]).unwrap().unwrap();
        assert_eq!(new_key, 1);
        let sb = ctx.get_sub_bucket(1).unwrap();
        assert_eq!(sb.cards.get(&1), Some(&2));
        assert_eq!(sb.cards.get(&2), Some(&2));
    }

    #[test]
    fn propagate_key_renames_to_new_minimum() {
        let store = MemoryKvStore::new();
        let evidence: Arc<InMemoryEvidenceStore> = Arc::new(InMemoryEvidenceStore::new());
        let mut ctx = new_ctx(&store, &evidence);

        let sb = SubBucket::singleton(5, &[]);
        ctx.set_card_sub_bucket(5, Some(5));
        ctx.put_sub_bucket(sb);

        let new_key = sub_bucket_add_card(&mut ctx, 5, 1, &[5]).unwrap().unwrap();
        assert_eq!(new_key, 1);
        assert!(ctx.get_sub_bucket(1).unwrap().cards.contains_key(&5));
    }

    #[test]
    fn bucket_set_merge_folds_membership_and_reassigns_owners() {
        let store = MemoryKvStore::new();
        let evidence: Arc<InMemoryEvidenceStore> = Arc::new(InMemoryEvidenceStore::new());
        let mut ctx = new_ctx(&store, &evidence);

        let mut sb_a = SubBucket::singleton(1, &[]);
        sb_a.bucket_set_id = 1;
        ctx.put_sub_bucket(sb_a);
        let mut sb_b = SubBucket::singleton(5, &[]);
        sb_b.bucket_set_id = 5;
        ctx.put_sub_bucket(sb_b);

        let merged = bucket_set_merge(&mut ctx, 1, 5).unwrap().unwrap();
        assert_eq!(merged, 1);
        let bs = ctx.get_bucket_set(1).unwrap();
        assert!(bs.sub_bucket_ids.contains(&1));
        assert!(bs.sub_bucket_ids.contains(&5));
        assert_eq!(ctx.get_sub_bucket(5).unwrap().bucket_set_id, 1);
    }
}
