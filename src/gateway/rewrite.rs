//! Follow-up detection and query rewriting.
//!
//! Pure string logic, no I/O: detects whether a query is a context-
//! dependent follow-up (a singular third-person reference, or a short
//! query) and substitutes the active entity name in when one is known.

const SINGULAR_REFERENCES: &[&str] = &["it", "this", "that", "its"];
const SHORT_QUERY_MAX_TOKENS: usize = 7;

fn tokens(query: &str) -> Vec<&str> {
    query.split_whitespace().collect()
}

fn strip_punctuation(word: &str) -> String {
    word.chars().filter(|c| c.is_alphanumeric() || *c == '\'').collect()
}

/// True if `query` contains a singular third-person reference, or has at
/// most `SHORT_QUERY_MAX_TOKENS` whitespace-separated tokens. Plural
/// references ("they", "them", "those") are deliberately excluded.
pub fn is_follow_up(query: &str) -> bool {
    let toks = tokens(query);
    let has_singular_reference = toks
        .iter()
        .map(|w| strip_punctuation(w).to_lowercase())
        .any(|w| SINGULAR_REFERENCES.contains(&w.as_str()));
    has_singular_reference || toks.len() <= SHORT_QUERY_MAX_TOKENS
}

/// Substitutes every singular third-person reference token with
/// `active_entity_name`, leaving the query unchanged if no reference is
/// present (the short-query branch of follow-up detection has nothing to
/// substitute).
pub fn rewrite(query: &str, active_entity_name: &str) -> String {
    let mut out_words = Vec::new();
    for word in query.split_whitespace() {
        let stripped = strip_punctuation(word).to_lowercase();
        if SINGULAR_REFERENCES.contains(&stripped.as_str()) {
            out_words.push(active_entity_name.to_string());
        } else {
            out_words.push(word.to_string());
        }
    }
    out_words.join(" ")
}

/// Rewrites `query` if it is a follow-up and an active entity name is
/// known; otherwise returns the query unchanged (the "unresolvable
/// follow-up" contract: forward unchanged, never block).
pub fn maybe_rewrite(query: &str, active_entity_name: Option<&str>) -> String {
    if !is_follow_up(query) {
        return query.to_string();
    }
    match active_entity_name {
        Some(name) => rewrite(query, name),
        None => query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singular_reference_detected() {
        assert!(is_follow_up("When is it offered?"));
        assert!(is_follow_up("Tell me more about this"));
    }

    #[test]
    fn plural_reference_alone_not_detected() {
        assert!(!is_follow_up("When are they offered throughout the whole semester next year"));
    }

    #[test]
    fn short_query_detected_even_without_reference() {
        assert!(is_follow_up("And the prerequisites?"));
    }

    #[test]
    fn rewrite_substitutes_singular_reference() {
        let rewritten = rewrite("When is it offered?", "Databases and SQL");
        assert_eq!(rewritten, "When is Databases and SQL offered?");
    }

    #[test]
    fn maybe_rewrite_passes_through_without_active_entity() {
        let rewritten = maybe_rewrite("When is it offered?", None);
        assert_eq!(rewritten, "When is it offered?");
    }

    #[test]
    fn maybe_rewrite_passes_through_non_follow_up_unchanged() {
        let long_query = "Explain the full history of relational databases from first principles please";
        let rewritten = maybe_rewrite(long_query, Some("Databases and SQL"));
        assert_eq!(rewritten, long_query);
    }
}
