//! Sentence normalizer (C1): turns a card's fulltext into a canonical, ordered
//! sequence of sentences used as the unit of comparison everywhere downstream.

use once_cell::sync::Lazy;
use regex::Regex;

/// A run of terminal punctuation, optional digits, then whitespace. Treated
/// as a sentence boundary only when the following character is a capital
/// letter (checked manually below, since the `regex` crate has no lookahead),
/// which lets footnote numerals like "...claim.1 The next sentence..." survive
/// without splitting mid-citation.
static SENTENCE_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.?!]+\d*\s+").unwrap());

static NON_ALPHA: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z]+").unwrap());

/// Split `fulltext` into normalized sentences, dropping fragments shorter than
/// `cutoff` characters (after normalization). Order is preserved and is the
/// card's positional sentence index.
pub fn normalize_sentences(fulltext: &str, cutoff: usize) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BOUNDARY.find_iter(fulltext) {
        let followed_by_capital = fulltext[m.end()..].chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
        if followed_by_capital {
            fragments.push(&fulltext[start..m.start()]);
            start = m.end();
        }
    }
    fragments.push(&fulltext[start..]);

    fragments.into_iter().map(normalize_fragment).filter(|s| s.len() >= cutoff).collect()
}

/// Normalize a single fragment: strip non-alphabetic characters, lowercase.
fn normalize_fragment(fragment: &str) -> String {
    NON_ALPHA.replace_all(fragment, "").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_punctuation_before_capital() {
        let text = "This is the first sentence here. This is the second one also here!";
        let sentences = normalize_sentences(text, 5);
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn survives_footnote_numerals() {
        let text = "This astonishing claim was made.1 The next sentence follows immediately after.";
        let sentences = normalize_sentences(text, 5);
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn drops_short_fragments() {
        let text = "Hi. This one is long enough to survive the cutoff filter.";
        let sentences = normalize_sentences(text, 20);
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn strips_non_alpha_and_lowercases() {
        let text = "Item 42: The Rules Apply Here, Strictly And Without Exception!";
        let sentences = normalize_sentences(text, 1);
        assert!(sentences[0].chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn normalize_fragment_is_idempotent() {
        // Once a fragment has gone through normalization, normalizing it again
        // changes nothing: there is no punctuation left to split on and no
        // non-alphabetic character left to strip.
        let fragment = "this is already normalized text with no punctuation left";
        assert_eq!(normalize_fragment(fragment), normalize_fragment(&normalize_fragment(fragment)));
    }
}
