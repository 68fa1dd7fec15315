//! Matcher (C7): candidate generation plus the inside/edge positional overlap
//! test that decides whether two cards are the same underlying text.

use crate::context::Context;
use crate::errors::{CardId, DedupeError};
use crate::evidence::EvidenceStore;
use crate::fingerprint::Fingerprint;
use crate::normalize::normalize_sentences;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub matches: Vec<CardId>,
    pub existing_sentences: bool,
}

#[derive(Clone, Copy, Debug)]
struct Span {
    card_len: u32,
    min_index: u32,
    max_index: u32,
}

/// `checkMatch(x, y)`: either `x` lies almost entirely inside `y` (INSIDE), or
/// the head of `x` aligns with the tail of `y` (EDGE).
fn check_match(x: &Span, y: &Span, edge_tolerance: u32, inside_tolerance: u32) -> bool {
    let inside = x.card_len > 3
        && x.card_len.saturating_sub(x.max_index + 1 - x.min_index) <= inside_tolerance;
    let edge = x.min_index <= edge_tolerance && y.card_len.saturating_sub(y.max_index) <= edge_tolerance;
    inside || edge
}

fn is_match(a: &Span, b: &Span, edge_tolerance: u32, inside_tolerance: u32) -> bool {
    check_match(a, b, edge_tolerance, inside_tolerance) || check_match(b, a, edge_tolerance, inside_tolerance)
}

/// Load and normalize a card's sentences from the evidence store. Fails with
/// `MissingCard` if the evidence store has no row for it.
pub fn sentences_for_card(
    evidence: &dyn EvidenceStore,
    sentence_cutoff: usize,
    card_id: CardId,
) -> Result<Vec<String>, DedupeError> {
    let fulltext = evidence.lookup_fulltext(card_id).ok_or(DedupeError::MissingCard(card_id))?;
    Ok(normalize_sentences(&fulltext, sentence_cutoff))
}

/// Find every card that matches `card_id`'s `sentences` by positional overlap.
pub fn find_matches(ctx: &mut Context, card_id: CardId, sentences: &[String]) -> Result<MatchResult, DedupeError> {
    let (edge_tolerance, inside_tolerance) = (ctx.config().edge_tolerance, ctx.config().inside_tolerance);
    let bucket_key_bits = ctx.config().bucket_key_bits();

    let mut spans: HashMap<CardId, (u32, u32, u32, u32)> = HashMap::new(); // (a_min, a_max, b_min, b_max)
    let mut existing_sentences = false;

    for (i, sentence) in sentences.iter().enumerate() {
        let fp = Fingerprint::of(sentence, bucket_key_bits);
        let occurrences = ctx.sentence_occurrences(fp)?;
        for (other_id, other_index) in occurrences {
            if other_id == card_id {
                existing_sentences = true;
                continue;
            }
            let i = i as u32;
            let other_index = other_index as u32;
            spans
                .entry(other_id)
                .and_modify(|(a_min, a_max, b_min, b_max)| {
                    *a_min = (*a_min).min(i);
                    *a_max = (*a_max).max(i);
                    *b_min = (*b_min).min(other_index);
                    *b_max = (*b_max).max(other_index);
                })
                .or_insert((i, i, other_index, other_index));
        }
    }

    let a_len = sentences.len() as u32;
    let mut matches = Vec::with_capacity(spans.len());
    for (other_id, (a_min, a_max, b_min, b_max)) in spans {
        let b_len = ctx.card_length(other_id)?;
        let a = Span { card_len: a_len, min_index: a_min, max_index: a_max };
        let b = Span { card_len: b_len, min_index: b_min, max_index: b_max };
        if is_match(&a, &b, edge_tolerance, inside_tolerance) {
            matches.push(other_id);
        }
    }
    matches.sort_unstable();
    Ok(MatchResult { matches, existing_sentences })
}
