//! The evidence store (C11, ambient): a read-only lookup from card id to
//! fulltext. The production backend is a relational database; here we ship
//! the in-process reference implementation the CLI and tests run against.

use crate::errors::CardId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub trait EvidenceStore: Send + Sync {
    fn lookup_fulltext(&self, card_id: CardId) -> Option<String>;
}

#[derive(Clone, Default)]
pub struct InMemoryEvidenceStore {
    rows: Arc<RwLock<HashMap<CardId, String>>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, card_id: CardId, fulltext: impl Into<String>) {
        self.rows.write().insert(card_id, fulltext.into());
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl EvidenceStore for InMemoryEvidenceStore {
    fn lookup_fulltext(&self, card_id: CardId) -> Option<String> {
        self.rows.read().get(&card_id).cloned()
    }
}
