//! SentenceIndex (C2): maps a sentence fingerprint to the list of
//! `(cardId, sentenceIndex)` occurrences, sharded by `bucketKey`.
//!
//! Each shard (`S:<bucketKey>`) is an append-only byte string: a
//! concatenation of 11-byte records `subKey(5) ‖ cardId(4 BE) ‖
//! sentenceIndex(2 BE)`. Readers filter the shard by `subKey`; collisions are
//! tolerated because the Matcher re-validates by positional overlap.

use crate::errors::{CardId, DedupeError};
use crate::fingerprint::Fingerprint;
use crate::kv::Transaction;
use std::collections::HashMap;

pub const RECORD_LEN: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentenceRecord {
    pub sub_key: u64,
    pub card_id: CardId,
    pub sentence_index: u16,
}

impl SentenceRecord {
    fn pack(self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        let sub_bytes = self.sub_key.to_be_bytes(); // 8 bytes, top 3 are zero (40-bit value)
        buf[0..5].copy_from_slice(&sub_bytes[3..8]);
        buf[5..9].copy_from_slice(&self.card_id.to_be_bytes());
        buf[9..11].copy_from_slice(&self.sentence_index.to_be_bytes());
        buf
    }

    fn unpack(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), RECORD_LEN);
        let mut sub_bytes = [0u8; 8];
        sub_bytes[3..8].copy_from_slice(&bytes[0..5]);
        let sub_key = u64::from_be_bytes(sub_bytes);
        let card_id = CardId::from_be_bytes(bytes[5..9].try_into().unwrap());
        let sentence_index = u16::from_be_bytes(bytes[9..11].try_into().unwrap());
        SentenceRecord { sub_key, card_id, sentence_index }
    }
}

/// Per-Context cache of parsed shards, shared across the Matcher (reads) and
/// the Processor's post-match append (writes) within one unit of work.
#[derive(Default)]
pub struct SentenceIndex {
    key_prefix: String,
    loaded: HashMap<String, Vec<SentenceRecord>>,
}

impl SentenceIndex {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self { key_prefix: key_prefix.into(), loaded: HashMap::new() }
    }

    fn shard_key(&self, bucket_key_hex: &str) -> String {
        format!("{}S:{}", self.key_prefix, bucket_key_hex)
    }

    fn ensure_loaded(&mut self, tx: &mut Transaction, bucket_key_hex: &str) -> Result<(), DedupeError> {
        if self.loaded.contains_key(bucket_key_hex) {
            return Ok(());
        }
        let key = self.shard_key(bucket_key_hex);
        let bytes = tx.get_bytes(&key);
        if !bytes.len().is_multiple_of(RECORD_LEN) {
            return Err(DedupeError::CorruptShard { key, len: bytes.len() });
        }
        let records = bytes.chunks_exact(RECORD_LEN).map(SentenceRecord::unpack).collect();
        self.loaded.insert(bucket_key_hex.to_string(), records);
        Ok(())
    }

    /// `fetch`: occurrences whose fingerprint matches exactly (same bucket and
    /// sub key) as the queried sentence.
    pub fn occurrences_for(
        &mut self,
        tx: &mut Transaction,
        fingerprint: Fingerprint,
    ) -> Result<Vec<(CardId, u16)>, DedupeError> {
        let bucket_hex = fingerprint.bucket_key_hex();
        self.ensure_loaded(tx, &bucket_hex)?;
        Ok(self.loaded[&bucket_hex]
            .iter()
            .filter(|r| r.sub_key == fingerprint.sub_key)
            .map(|r| (r.card_id, r.sentence_index))
            .collect())
    }

    /// `addOccurrence`: appends one packed record to the shard's pending
    /// writes and to this context's local view of the shard.
    pub fn add_occurrence(
        &mut self,
        tx: &mut Transaction,
        fingerprint: Fingerprint,
        card_id: CardId,
        sentence_index: u16,
    ) -> Result<(), DedupeError> {
        let bucket_hex = fingerprint.bucket_key_hex();
        self.ensure_loaded(tx, &bucket_hex)?;
        let record = SentenceRecord { sub_key: fingerprint.sub_key, card_id, sentence_index };
        self.loaded.get_mut(&bucket_hex).unwrap().push(record);
        let key = self.shard_key(&bucket_hex);
        tx.append_bytes(&key, &record.pack());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn record_pack_unpack_round_trip() {
        let rec = SentenceRecord { sub_key: 0x12_3456_789a, card_id: 4242, sentence_index: 7 };
        let packed = rec.pack();
        assert_eq!(packed.len(), RECORD_LEN);
        let unpacked = SentenceRecord::unpack(&packed);
        assert_eq!(rec, unpacked);
    }

    #[test]
    fn add_then_fetch_within_same_context() {
        let store = MemoryKvStore::new();
        let mut tx = store.begin();
        let mut idx = SentenceIndex::new("");
        let fp = Fingerprint::of("a sentence that fingerprints nicely", crate::fingerprint::DEFAULT_BUCKET_KEY_BITS);
        idx.add_occurrence(&mut tx, fp, 1, 0).unwrap();
        idx.add_occurrence(&mut tx, fp, 2, 3).unwrap();
        let occ = idx.occurrences_for(&mut tx, fp).unwrap();
        assert_eq!(occ.len(), 2);
        assert!(occ.contains(&(1, 0)));
        assert!(occ.contains(&(2, 3)));
    }

    #[test]
    fn corrupt_shard_is_rejected() {
        let store = MemoryKvStore::new();
        let mut tx = store.begin();
        tx.append_bytes("S:00000", &[1, 2, 3]); // not a multiple of 11
        tx.commit().unwrap();

        let mut tx2 = store.begin();
        let mut idx = SentenceIndex::new("");
        let fp = Fingerprint { bucket_key: 0, sub_key: 0 };
        let err = idx.occurrences_for(&mut tx2, fp).unwrap_err();
        assert!(matches!(err, DedupeError::CorruptShard { .. }));
    }

    #[test]
    fn persists_across_separate_transactions() {
        let store = MemoryKvStore::new();
        let fp = Fingerprint::of("persisted across commits", crate::fingerprint::DEFAULT_BUCKET_KEY_BITS);

        {
            let mut tx = store.begin();
            let mut idx = SentenceIndex::new("");
            idx.add_occurrence(&mut tx, fp, 9, 1).unwrap();
            tx.commit().unwrap();
        }
        {
            let mut tx = store.begin();
            let mut idx = SentenceIndex::new("");
            let occ = idx.occurrences_for(&mut tx, fp).unwrap();
            assert_eq!(occ, vec![(9, 1)]);
        }
    }
}
