mod config;
mod context;
mod diagnostics;
mod driver;
mod errors;
mod evidence;
mod fingerprint;
mod kv;
mod matcher;
mod model;
mod normalize;
mod processor;
mod sentence_index;
mod util;

pub use crate::config::DedupeConfig;
pub use crate::context::{BucketSetSummary, ProcessOutcome};
pub use crate::diagnostics::{dump_clusters, ClusterSummary, SubBucketSummary};
pub use crate::driver::{ingest, IngestReport};
pub use crate::errors::{CardId, DedupeError, Result};
pub use crate::evidence::{EvidenceStore, InMemoryEvidenceStore};
pub use crate::fingerprint::Fingerprint;
pub use crate::kv::MemoryKvStore;
pub use crate::model::{BucketSet, SubBucket};
pub use crate::normalize::normalize_sentences;
pub use crate::processor::process_card;
pub use crate::util::init_tracing_once;
