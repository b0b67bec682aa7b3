//! Structural and factual checks on generated answers.
//!
//! Returns a plain data struct, never an exception: verification failures
//! are surfaced to callers as a structured error list, not thrown.

use evalexpr::eval_number;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::models::Chunk;
use crate::prompt::STRICT_REFUSAL;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationError {
    NoCitation,
    UnknownCitation(String),
    UnsupportedNumber(String),
    UnsupportedDate(String),
    CalcMismatch { expr: String, declared: f64, computed: f64 },
    CalcParseError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub is_refusal: bool,
    pub errors: Vec<VerificationError>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.is_refusal || self.errors.is_empty()
    }
}

static SOURCE_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[source:\s*([^\]]+)\]").unwrap());
static CALC_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[calc:\s*([^=\]]+)=\s*([-+]?[0-9]*\.?[0-9]+)\s*\]").unwrap());
static INTEGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\b").unwrap());
static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap());

/// Strips `[calc: expr = value]` and `[source: ...]` spans so the number/date
/// scan only sees prose, not a calc's declared value or a source label.
fn strip_tagged_spans(answer: &str) -> String {
    let without_calc = CALC_TAG_RE.replace_all(answer, "");
    SOURCE_TAG_RE.replace_all(&without_calc, "").into_owned()
}

fn extract_cited_ids(answer: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for caps in SOURCE_TAG_RE.captures_iter(answer) {
        let list = &caps[1];
        for id in list.split(',') {
            let id = id.trim();
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

pub struct Verifier;

impl Verifier {
    pub fn verify(answer: &str, evidence: &[Chunk]) -> VerificationResult {
        if answer.trim() == STRICT_REFUSAL {
            return VerificationResult { is_refusal: true, errors: Vec::new() };
        }

        let mut errors = Vec::new();

        let cited_ids = extract_cited_ids(answer);
        if cited_ids.is_empty() {
            errors.push(VerificationError::NoCitation);
        }

        let evidence_ids: HashSet<String> = evidence.iter().map(|c| c.chunk_id.to_lowercase()).collect();
        let cited_ids_lower: HashSet<String> = cited_ids.iter().map(|s| s.to_lowercase()).collect();
        for id in &cited_ids_lower {
            if !evidence_ids.contains(id) {
                errors.push(VerificationError::UnknownCitation(id.clone()));
            }
        }

        let cited_text: String = evidence
            .iter()
            .filter(|c| cited_ids_lower.contains(&c.chunk_id.to_lowercase()))
            .map(|c| c.text.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let scan_text = strip_tagged_spans(answer);
        for m in INTEGER_RE.find_iter(&scan_text) {
            let num = m.as_str();
            if !cited_text.contains(num) {
                errors.push(VerificationError::UnsupportedNumber(num.to_string()));
            }
        }
        for m in ISO_DATE_RE.find_iter(&scan_text) {
            let date = m.as_str();
            if !cited_text.contains(date) {
                errors.push(VerificationError::UnsupportedDate(date.to_string()));
            }
        }

        for caps in CALC_TAG_RE.captures_iter(answer) {
            let expr = caps[1].trim().to_string();
            let declared: f64 = match caps[2].parse() {
                Ok(v) => v,
                Err(_) => {
                    errors.push(VerificationError::CalcParseError(expr));
                    continue;
                }
            };
            match eval_number(&expr) {
                Ok(computed) => {
                    if (computed - declared).abs() > 1e-6 {
                        errors.push(VerificationError::CalcMismatch { expr, declared, computed });
                    }
                }
                Err(_) => errors.push(VerificationError::CalcParseError(expr)),
            }
        }

        VerificationResult { is_refusal: false, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkType;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            chunk_type: ChunkType::Topic,
            title: "T".to_string(),
            text: text.to_string(),
            metadata: serde_json::json!({}),
            created_at: 0,
        }
    }

    #[test]
    fn exact_refusal_string_passes_as_refusal() {
        let result = Verifier::verify(STRICT_REFUSAL, &[]);
        assert!(result.is_refusal);
        assert!(result.passed());
    }

    #[test]
    fn missing_citation_fails() {
        let result = Verifier::verify("The course started in January.", &[chunk("A", "stuff")]);
        assert!(result.errors.contains(&VerificationError::NoCitation));
    }

    #[test]
    fn unknown_citation_fails() {
        let answer = "It started in 2024. [source: ZZZ]";
        let evidence = vec![chunk("A", "started 2024")];
        let result = Verifier::verify(answer, &evidence);
        assert!(result.errors.iter().any(|e| matches!(e, VerificationError::UnknownCitation(_))));
    }

    #[test]
    fn number_supported_by_cited_chunk_passes() {
        let answer = "There are 12 classes. [source: A]";
        let evidence = vec![chunk("A", "There are 12 classes scheduled.")];
        let result = Verifier::verify(answer, &evidence);
        assert!(result.passed());
    }

    #[test]
    fn number_not_in_cited_chunk_fails() {
        let answer = "There are 99 classes. [source: A]";
        let evidence = vec![chunk("A", "There are 12 classes scheduled.")];
        let result = Verifier::verify(answer, &evidence);
        assert!(result.errors.iter().any(|e| matches!(e, VerificationError::UnsupportedNumber(n) if n == "99")));
    }

    #[test]
    fn iso_date_supported_by_cited_chunk_passes() {
        let answer = "Learned at 2024-01-15. [source: A]";
        let evidence = vec![chunk("A", "learned at 2024-01-15")];
        let result = Verifier::verify(answer, &evidence);
        assert!(result.passed());
    }

    #[test]
    fn calc_tag_matching_expression_passes() {
        let answer = "Total is [calc: 2 + 2 = 4]. [source: A]";
        let evidence = vec![chunk("A", "irrelevant")];
        let result = Verifier::verify(answer, &evidence);
        assert!(result.passed());
    }

    #[test]
    fn calc_tag_mismatched_expression_fails() {
        let answer = "Total is [calc: 2 + 2 = 5]. [source: A]";
        let evidence = vec![chunk("A", "irrelevant")];
        let result = Verifier::verify(answer, &evidence);
        assert!(result.errors.iter().any(|e| matches!(e, VerificationError::CalcMismatch { .. })));
    }

    #[test]
    fn citation_is_case_insensitive() {
        let answer = "Fact noted. [source: abc]";
        let evidence = vec![chunk("ABC", "fact noted here")];
        let result = Verifier::verify(answer, &evidence);
        assert!(!result.errors.iter().any(|e| matches!(e, VerificationError::UnknownCitation(_))));
    }
}
