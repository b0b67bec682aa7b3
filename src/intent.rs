//! Intent classification: ordered pattern tests, no I/O.

use crate::models::Intent;

const GREETING_PATTERNS: &[&str] = &["hello", "hi", "hey", "good morning", "good afternoon", "good evening", "howdy"];

const FACTUAL_PATTERNS: &[&str] = &["list", "count", "how many", "what are the", "which"];

const SEMANTIC_PATTERNS: &[&str] = &["describe", "explain", "summarize", "tell me about"];

fn contains_any(q: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| q.contains(p))
}

fn is_greeting(q: &str) -> bool {
    let trimmed = q.trim();
    GREETING_PATTERNS.iter().any(|p| trimmed == *p || trimmed.starts_with(&format!("{p} ")) || trimmed.starts_with(&format!("{p},")))
}

fn has_temporal_cue(q: &str) -> bool {
    q.contains("when")
}

/// An "entity token" for temporal-cue purposes: a topic/course identifier
/// shape (`C<digits>-T<digits>`), or a capitalized word outside the cue
/// itself, good enough for the pure pattern-based classifier this spec
/// calls for.
fn has_entity_token(q: &str) -> bool {
    crate::orchestrator::TOPIC_ID_RE.is_match(q) || q.split_whitespace().any(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
}

/// Ordered pattern classification into {greeting, factual, semantic,
/// mixed}, default fallback mixed.
pub fn classify(query: &str) -> Intent {
    let q = query.to_lowercase();

    if is_greeting(&q) {
        return Intent::Greeting;
    }

    let is_factual = contains_any(&q, FACTUAL_PATTERNS) || (has_temporal_cue(&q) && has_entity_token(query));
    let is_semantic = contains_any(&q, SEMANTIC_PATTERNS);

    if is_factual && is_semantic {
        return Intent::Mixed;
    }
    if is_factual {
        return Intent::Factual;
    }
    if is_semantic {
        return Intent::Semantic;
    }

    Intent::Mixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_classified() {
        assert_eq!(classify("hello"), Intent::Greeting);
        assert_eq!(classify("Hi there"), Intent::Greeting);
    }

    #[test]
    fn factual_count_cue() {
        assert_eq!(classify("How many classes for C1-T1?"), Intent::Factual);
    }

    #[test]
    fn factual_list_cue() {
        assert_eq!(classify("List all courses"), Intent::Factual);
    }

    #[test]
    fn semantic_describe_cue() {
        assert_eq!(classify("Describe each course"), Intent::Semantic);
    }

    #[test]
    fn temporal_with_entity_is_factual() {
        assert_eq!(classify("When did I learn C2-T3?"), Intent::Factual);
    }

    #[test]
    fn mixed_when_factual_and_semantic_cues_present() {
        assert_eq!(classify("List and explain the topics"), Intent::Mixed);
    }

    #[test]
    fn default_fallback_is_mixed() {
        assert_eq!(classify("asdkjf qwoeiru"), Intent::Mixed);
    }
}
