//! User-facing tunables with sensible defaults and builder chaining, mirroring
//! the options-struct style used elsewhere in this codebase's predecessors.

/// Configuration for the deduplication engine. All fields have defaults drawn
/// from the specification; override individual knobs via the builder methods.
#[derive(Clone, Debug)]
pub struct DedupeConfig {
    /// Positional-overlap slack when one card's head aligns with another's tail.
    pub edge_tolerance: u32,
    /// Positional-overlap slack when one card lies almost entirely inside another.
    pub inside_tolerance: u32,
    /// Normalized sentences shorter than this (in characters) are dropped.
    pub sentence_cutoff: usize,
    /// SHOULD_MATCH: a card belongs in a SubBucket when `matches / members > this`.
    pub should_match_threshold: f64,
    /// SHOULD_MERGE: ratio term, `matches / size >= this`.
    pub should_merge_ratio: f64,
    /// SHOULD_MERGE: absolute term, `matches > this` short-circuits the ratio check.
    pub should_merge_absolute: u32,
    /// Upper bound on concurrent per-card units of work against the shared store.
    pub concurrent_deduplication: usize,
    /// Number of bits of the sentence fingerprint used as the shard (`bucketKey`) key.
    pub sentence_shard_bits: u32,
    /// Namespace prepended to every KV key this engine touches.
    pub key_prefix: String,
    /// Cap on Processor retries after an optimistic-lock conflict. `None` means unbounded.
    pub max_retries: Option<usize>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            edge_tolerance: 1,
            inside_tolerance: 2,
            sentence_cutoff: 20,
            should_match_threshold: 0.5,
            should_merge_ratio: 0.2,
            should_merge_absolute: 5,
            concurrent_deduplication: 10,
            sentence_shard_bits: crate::fingerprint::DEFAULT_BUCKET_KEY_BITS,
            key_prefix: String::new(),
            max_retries: None,
        }
    }
}

impl DedupeConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
    pub fn with_concurrent_deduplication(mut self, n: usize) -> Self {
        self.concurrent_deduplication = n.max(1);
        self
    }
    pub fn with_sentence_cutoff(mut self, n: usize) -> Self {
        self.sentence_cutoff = n;
        self
    }
    pub fn with_max_retries(mut self, n: usize) -> Self {
        self.max_retries = Some(n);
        self
    }
    pub fn with_sentence_shard_bits(mut self, n: u32) -> Self {
        self.sentence_shard_bits = n;
        self
    }

    /// Number of leading digest bits `Fingerprint::of` uses to derive the
    /// `bucketKey` that selects a sentence shard.
    pub fn bucket_key_bits(&self) -> u32 {
        self.sentence_shard_bits
    }
}
