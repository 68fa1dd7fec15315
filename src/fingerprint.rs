//! Sentence fingerprinting: MD5 digest of a normalized sentence, split into a
//! `bucketKey` (top `bucket_key_bits` bits, selects the shard; configurable
//! via `DedupeConfig::sentence_shard_bits`, default 20) and a `subKey` (the
//! next 40 bits, disambiguates within the shard — fixed width, since the
//! 11-byte sentence record format hardcodes 5 bytes for it). The remaining
//! bits are discarded.

/// Fixed width of `subKey`: the wire format packs it into 5 bytes.
pub const SUB_KEY_BITS: u32 = 40;

/// Default width of `bucketKey` when no override is configured.
pub const DEFAULT_BUCKET_KEY_BITS: u32 = 20;

/// A fingerprint derived from a normalized sentence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub bucket_key: u32,
    pub sub_key: u64,
}

impl Fingerprint {
    /// `bucket_key_bits` is `DedupeConfig::sentence_shard_bits`: how many of
    /// the digest's leading bits select the shard.
    pub fn of(sentence: &str, bucket_key_bits: u32) -> Self {
        let digest = md5::compute(sentence.as_bytes());
        let bytes: [u8; 16] = digest.0;

        // The first 8 bytes of the digest, as a single big-endian integer:
        // bit 0 (MSB) through bit 63 (LSB) of this value are digest bits
        // [0..64). bucket_key is bits [0,bucket_key_bits), sub_key is the
        // next 40 bits [bucket_key_bits, bucket_key_bits+40); anything past
        // bit 60 (when bucket_key_bits == 20) is discarded.
        let window = u64::from_be_bytes(bytes[0..8].try_into().unwrap());

        let bucket_key = ((window >> (64 - bucket_key_bits)) & ((1u64 << bucket_key_bits) - 1)) as u32;
        let sub_key = (window >> (64 - bucket_key_bits - SUB_KEY_BITS)) & ((1u64 << SUB_KEY_BITS) - 1);

        Fingerprint { bucket_key, sub_key }
    }

    /// `bucketKey` rendered as the 5 hex-char shard key used in the KV layout.
    pub fn bucket_key_hex(&self) -> String {
        format!("{:05x}", self.bucket_key)
    }

    /// `subKey` rendered as the 10 hex-char value packed into sentence records.
    pub fn sub_key_hex(&self) -> String {
        format!("{:010x}", self.sub_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Fingerprint::of("the quick brown fox", DEFAULT_BUCKET_KEY_BITS);
        let b = Fingerprint::of("the quick brown fox", DEFAULT_BUCKET_KEY_BITS);
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_different_sentences() {
        let a = Fingerprint::of("the quick brown fox", DEFAULT_BUCKET_KEY_BITS);
        let b = Fingerprint::of("a slow red hen", DEFAULT_BUCKET_KEY_BITS);
        assert_ne!((a.bucket_key, a.sub_key), (b.bucket_key, b.sub_key));
    }

    #[test]
    fn bucket_key_fits_20_bits() {
        let fp = Fingerprint::of("some sentence to fingerprint", DEFAULT_BUCKET_KEY_BITS);
        assert!(fp.bucket_key < (1 << DEFAULT_BUCKET_KEY_BITS));
    }

    #[test]
    fn sub_key_fits_40_bits() {
        let fp = Fingerprint::of("some sentence to fingerprint", DEFAULT_BUCKET_KEY_BITS);
        assert!(fp.sub_key < (1u64 << SUB_KEY_BITS));
    }

    #[test]
    fn hex_rendering_widths() {
        let fp = Fingerprint::of("x", DEFAULT_BUCKET_KEY_BITS);
        assert_eq!(fp.bucket_key_hex().len(), 5);
        assert_eq!(fp.sub_key_hex().len(), 10);
    }

    #[test]
    fn narrower_bucket_key_bits_shifts_the_sub_key_window() {
        // With fewer bucket_key_bits, sub_key starts earlier in the digest
        // and so differs from the default-width split for the same input.
        let wide = Fingerprint::of("shifting windows test sentence", DEFAULT_BUCKET_KEY_BITS);
        let narrow = Fingerprint::of("shifting windows test sentence", 12);
        assert!(narrow.bucket_key < (1 << 12));
        assert_ne!(wide.sub_key, narrow.sub_key);
    }
}
