//! Entity data model (C3-C6): CardLength, CardSubBucket, SubBucket, BucketSet,
//! and the aggregate predicates used to decide membership and merging.
//!
//! These are plain data + pure functions; the algorithms that mutate them
//! (`addCard`, `resolve`, `merge`, ...) live in `context.rs` because they need
//! simultaneous access to sibling entities and the Matcher, which the
//! borrow checker prefers modeled as free functions over a single repository
//! handle rather than methods recursively borrowing `self`.

use crate::errors::{CardId, DedupeError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// SHOULD_MATCH(m, t) = m / t > threshold
pub fn should_match(m: u32, t: u32, threshold: f64) -> bool {
    t > 0 && (m as f64 / t as f64) > threshold
}

/// SHOULD_MERGE(m, t) = m > absolute OR m / t >= ratio
pub fn should_merge(m: u32, t: u32, ratio: f64, absolute: u32) -> bool {
    m > absolute || (t > 0 && (m as f64 / t as f64) >= ratio)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubBucket {
    pub key: CardId,
    /// cardId (member) -> internalMatchCount
    pub cards: BTreeMap<CardId, u32>,
    /// cardId (non-member) -> externalMatchCount
    pub matching: HashMap<CardId, u32>,
    pub bucket_set_id: CardId,
}

impl SubBucket {
    pub fn singleton(card_id: CardId, external_matches: &[CardId]) -> Self {
        let mut sb = SubBucket { key: card_id, cards: BTreeMap::new(), bucket_set_id: card_id, matching: HashMap::new() };
        sb.cards.insert(card_id, 1);
        for m in external_matches {
            *sb.matching.entry(*m).or_insert(0) += 1;
        }
        sb
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// `min(cards.keys)`, or `None` if the bucket is empty.
    pub fn min_card(&self) -> Option<CardId> {
        self.cards.keys().next().copied()
    }

    /// `doesBucketMatch`: SHOULD_MATCH(|cards ∩ externalMatches|, |cards|).
    pub fn does_bucket_match(&self, external_matches: &[CardId], threshold: f64) -> bool {
        let overlap = external_matches.iter().filter(|c| self.cards.contains_key(c)).count() as u32;
        should_match(overlap, self.cards.len() as u32, threshold)
    }

    /// The first member whose internal match count violates SHOULD_MATCH, if any.
    pub fn first_should_match_violation(&self, threshold: f64) -> Option<CardId> {
        let total = self.cards.len() as u32;
        self.cards
            .iter()
            .find(|(_, count)| !should_match(**count, total, threshold))
            .map(|(id, _)| *id)
    }

    /// Serialize to the `SB:<key>` hash payload: `bs`, `c<cardId>`, `m<cardId>`.
    pub fn to_hash(&self) -> HashMap<String, String> {
        let mut h = HashMap::with_capacity(1 + self.cards.len() + self.matching.len());
        h.insert("bs".to_string(), self.bucket_set_id.to_string());
        for (id, count) in &self.cards {
            h.insert(format!("c{id}"), count.to_string());
        }
        for (id, count) in &self.matching {
            h.insert(format!("m{id}"), count.to_string());
        }
        h
    }

    /// Deserialize from a `SB:<key>` hash payload.
    pub fn from_hash(key: CardId, fields: &HashMap<String, String>) -> Result<Self, DedupeError> {
        let mut sb = SubBucket { key, cards: BTreeMap::new(), matching: HashMap::new(), bucket_set_id: key };
        for (field, value) in fields {
            if field == "bs" {
                sb.bucket_set_id = value.parse().map_err(|_| DedupeError::InvalidHashKey {
                    key: format!("SB:{key}"),
                    field: field.clone(),
                })?;
            } else if let Some(rest) = field.strip_prefix('c') {
                let id: CardId = rest.parse().map_err(|_| DedupeError::InvalidHashKey {
                    key: format!("SB:{key}"),
                    field: field.clone(),
                })?;
                let count: u32 = value.parse().map_err(|_| DedupeError::InvalidHashKey {
                    key: format!("SB:{key}"),
                    field: field.clone(),
                })?;
                sb.cards.insert(id, count);
            } else if let Some(rest) = field.strip_prefix('m') {
                let id: CardId = rest.parse().map_err(|_| DedupeError::InvalidHashKey {
                    key: format!("SB:{key}"),
                    field: field.clone(),
                })?;
                let count: u32 = value.parse().map_err(|_| DedupeError::InvalidHashKey {
                    key: format!("SB:{key}"),
                    field: field.clone(),
                })?;
                sb.matching.insert(id, count);
            } else {
                return Err(DedupeError::InvalidHashKey { key: format!("SB:{key}"), field: field.clone() });
            }
        }
        Ok(sb)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketSet {
    pub key: CardId,
    pub sub_bucket_ids: BTreeSet<CardId>,
}

impl BucketSet {
    pub fn singleton(sub_bucket_key: CardId) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(sub_bucket_key);
        BucketSet { key: sub_bucket_key, sub_bucket_ids: ids }
    }

    pub fn min_sub_bucket(&self) -> Option<CardId> {
        self.sub_bucket_ids.iter().next().copied()
    }

    pub fn is_persisted(&self) -> bool {
        self.sub_bucket_ids.len() > 1
    }

    pub fn to_set(&self) -> HashSet<String> {
        self.sub_bucket_ids.iter().map(|id| id.to_string()).collect()
    }

    pub fn from_set(key: CardId, members: &HashSet<String>) -> Result<Self, DedupeError> {
        let mut ids = BTreeSet::new();
        for m in members {
            let id: CardId = m.parse().map_err(|_| DedupeError::InvalidHashKey {
                key: format!("BS:{key}"),
                field: m.clone(),
            })?;
            ids.insert(id);
        }
        if ids.is_empty() {
            ids.insert(key);
        }
        Ok(BucketSet { key, sub_bucket_ids: ids })
    }
}

/// The "CardSet" aggregate view of a collection of SubBuckets: their union of
/// members and the summed external match counts, used by `shouldMerge`.
pub struct CardSet {
    pub members: BTreeSet<CardId>,
    pub matching: HashMap<CardId, u32>,
}

impl CardSet {
    pub fn from_sub_buckets<'a>(buckets: impl IntoIterator<Item = &'a SubBucket>) -> Self {
        let mut members = BTreeSet::new();
        let mut matching: HashMap<CardId, u32> = HashMap::new();
        for sb in buckets {
            members.extend(sb.cards.keys().copied());
            for (id, count) in &sb.matching {
                *matching.entry(*id).or_insert(0) += count;
            }
        }
        CardSet { members, matching }
    }

    pub fn size(&self) -> u32 {
        self.members.len() as u32
    }
}

/// `shouldMerge(A, B)`: the asymmetric, recursive BucketSet merge predicate.
/// Applies SHOULD_MERGE per-member of `b` against `a`, then SHOULD_MERGE again
/// on the resulting count against `b`'s size.
pub fn should_merge_sets(a: &CardSet, b: &CardSet, ratio: f64, absolute: u32) -> bool {
    let qualifying = b
        .members
        .iter()
        .filter(|m| should_merge(*a.matching.get(m).unwrap_or(&0), a.size(), ratio, absolute))
        .count() as u32;
    should_merge(qualifying, b.size(), ratio, absolute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_match_boundary() {
        assert!(should_match(2, 3, 0.5)); // 0.666 > 0.5
        assert!(!should_match(1, 2, 0.5)); // 0.5 is not > 0.5
        assert!(should_match(1, 1, 0.5));
    }

    #[test]
    fn should_merge_absolute_or_ratio() {
        assert!(should_merge(6, 1000, 0.2, 5)); // absolute wins
        assert!(should_merge(2, 10, 0.2, 5)); // ratio 0.2 >= 0.2
        assert!(!should_merge(1, 10, 0.2, 5));
    }

    #[test]
    fn sub_bucket_hash_round_trip() {
        let mut sb = SubBucket::singleton(1, &[]);
        sb.cards.insert(2, 2);
        sb.matching.insert(99, 1);
        sb.bucket_set_id = 1;
        let hash = sb.to_hash();
        let parsed = SubBucket::from_hash(1, &hash).unwrap();
        assert_eq!(sb, parsed);
    }

    #[test]
    fn bucket_set_set_round_trip() {
        let mut bs = BucketSet::singleton(5);
        bs.sub_bucket_ids.insert(3);
        let set = bs.to_set();
        let parsed = BucketSet::from_set(3, &set).unwrap();
        assert_eq!(parsed.sub_bucket_ids, bs.sub_bucket_ids);
    }

    #[test]
    fn does_bucket_match_scenario_s2() {
        let sb = SubBucket::singleton(1, &[]);
        assert!(sb.does_bucket_match(&[1], 0.5));
    }

    #[test]
    fn does_bucket_match_scenario_s4_boundary() {
        let mut sb = SubBucket::singleton(1, &[]);
        sb.cards.insert(3, 1);
        sb.cards.insert(5, 1);
        // matches 1 and 3 out of {1,3,5}: 2/3 > 0.5 -> true
        assert!(sb.does_bucket_match(&[1, 3], 0.5));
    }
}
