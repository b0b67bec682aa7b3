//! Token-budgeted prompt assembly.
//!
//! Builds the final prompt sent to the generative model from reranked
//! context chunks and (optionally) prior conversation turns, staying
//! within a strict token budget while preserving "fact lines" verbatim
//! under truncation.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{Chunk, Turn};

const HISTORY_MAX_TURNS: usize = 6;
const HISTORY_TURN_CHAR_CAP: usize = 800;
const MIN_FALLBACK_CHARS: usize = 400;

pub const STRICT_REFUSAL: &str =
    "I don't have enough information in the provided context to answer that question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    /// Must cite `[source: CHUNK_ID]` for every factual sentence; refuse
    /// with the exact canonical phrase when unsupported.
    Strict,
    /// Used only under low confidence: best-effort answer, disclaimer
    /// applied by the caller outside the prompt.
    Lenient,
}

static FACT_LINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\btotal\b.*:\s*\d+").unwrap(),
        Regex::new(r"(?i)\blearned[ -]?at\b\s*:?.*\d").unwrap(),
        Regex::new(r"(?i)\bdue\b\s*:?.*\d").unwrap(),
        Regex::new(r"(?i)\bcreated\b\s*:?.*\d").unwrap(),
    ]
});

/// Rough token estimate: ~4 characters per token, matching the crude but
/// serviceable heuristic this crate uses elsewhere for budgeted text work.
fn estimate_tokens(s: &str) -> usize {
    s.chars().count().div_ceil(4).max(1)
}

fn chars_for_tokens(tokens: usize) -> usize {
    tokens.saturating_mul(4)
}

/// Extracts lines matching a fact pattern (verbatim, in order of
/// appearance) and returns the remainder with those lines removed.
fn extract_fact_lines(text: &str) -> (Vec<String>, String) {
    let mut facts = Vec::new();
    let mut rest_lines = Vec::new();
    for line in text.lines() {
        if FACT_LINE_PATTERNS.iter().any(|re| re.is_match(line)) {
            facts.push(line.to_string());
        } else {
            rest_lines.push(line);
        }
    }
    (facts, rest_lines.join("\n"))
}

/// "Head+tail preserving facts" truncation: fact lines are extracted and
/// prepended verbatim; the remaining budget is split between a head prefix
/// and a tail suffix of the non-fact remainder, joined by an ellipsis.
fn truncate_preserving_facts(text: &str, char_budget: usize) -> String {
    let (facts, rest) = extract_fact_lines(text);
    let facts_joined = facts.join("\n");
    let facts_len = facts_joined.chars().count();

    if facts_len >= char_budget {
        return facts_joined.chars().take(char_budget).collect();
    }

    let remaining = char_budget - facts_len - if facts.is_empty() { 0 } else { 1 };
    let rest_chars: Vec<char> = rest.chars().collect();

    let body = if rest_chars.len() <= remaining {
        rest
    } else {
        let ellipsis = " … ";
        let usable = remaining.saturating_sub(ellipsis.chars().count());
        let head_len = usable / 2;
        let tail_len = usable - head_len;
        let head: String = rest_chars.iter().take(head_len).collect();
        let tail: String = rest_chars.iter().rev().take(tail_len).collect::<Vec<_>>().into_iter().rev().collect();
        format!("{head}{ellipsis}{tail}")
    };

    if facts.is_empty() {
        body
    } else {
        format!("{facts_joined}\n{body}")
    }
}

fn truncate_tail_preserving(text: &str, char_cap: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= char_cap {
        return text.to_string();
    }
    let tail: String = chars[chars.len() - char_cap..].iter().collect();
    format!("…{tail}")
}

pub struct PromptAssembler {
    /// Global token budget `B`.
    pub budget: usize,
    /// Reserved answer budget `R`.
    pub reserved_answer: usize,
    /// Fixed overhead `O` (system instructions, formatting boilerplate).
    pub overhead: usize,
}

impl PromptAssembler {
    pub fn new(budget: usize, reserved_answer: usize, overhead: usize) -> Self {
        PromptAssembler {
            budget,
            reserved_answer,
            overhead,
        }
    }

    fn evidence_token_budget(&self) -> usize {
        self.budget.saturating_sub(self.reserved_answer).saturating_sub(self.overhead)
    }

    pub fn build(&self, context_chunks: &[Chunk], question: &str, context_k: usize, history: Option<&[Turn]>, variant: PromptVariant) -> String {
        let instructions = match variant {
            PromptVariant::Strict => format!(
                "Answer the question using only the evidence below. Cite every factual \
                 sentence with [source: CHUNK_ID]. If the evidence does not support an \
                 answer, reply exactly: \"{STRICT_REFUSAL}\""
            ),
            PromptVariant::Lenient => {
                "Answer the question as best you can using the evidence below, even if it \
                 is incomplete. Cite sources with [source: CHUNK_ID] where possible."
                    .to_string()
            }
        };
        let preamble = format!("{instructions}\n\nEvidence:\n");
        let postamble = format!("\nQuestion: {question}\nAnswer:");

        // The evidence budget is whatever's left after the wrapper text
        // (instructions + question + per-section separators) that every
        // build of this prompt pays regardless of how much evidence fits,
        // so the total never overruns `budget - reserved_answer` no matter
        // how long the instructions or question happen to be.
        let wrapper_chars = preamble.chars().count() + postamble.chars().count();
        let total_budget_chars = chars_for_tokens(self.budget.saturating_sub(self.reserved_answer));
        let overhead_chars = chars_for_tokens(self.overhead);
        let mut evidence_budget_chars = total_budget_chars
            .saturating_sub(overhead_chars)
            .saturating_sub(wrapper_chars);

        let mut sections = Vec::new();

        if let Some(turns) = history {
            let recent: Vec<&Turn> = turns.iter().rev().take(HISTORY_MAX_TURNS).rev().collect();
            if !recent.is_empty() {
                let mut history_block = String::from("Conversation so far:\n");
                for turn in recent {
                    let content = truncate_tail_preserving(&turn.content, HISTORY_TURN_CHAR_CAP);
                    history_block.push_str(&format!("{}: {}\n", turn.role, content));
                }
                // +1 for the separator newline appended after every section.
                let block_len = history_block.chars().count() + 1;
                evidence_budget_chars = evidence_budget_chars.saturating_sub(block_len);
                sections.push(history_block);
            }
        }

        let mut included_any = false;
        for chunk in context_chunks.iter().take(context_k) {
            let header = format!("[{}] {} ({})\n", chunk.chunk_id, chunk.title, chunk.chunk_type.as_str());
            let whole = format!("{header}{}\n", chunk.text);
            // +1 for the separator newline appended after every section.
            let whole_len = whole.chars().count() + 1;

            if whole_len <= evidence_budget_chars {
                sections.push(whole);
                evidence_budget_chars = evidence_budget_chars.saturating_sub(whole_len);
                included_any = true;
            } else if evidence_budget_chars > header.chars().count() + 21 {
                let body_budget = evidence_budget_chars - header.chars().count() - 1;
                let body = truncate_preserving_facts(&chunk.text, body_budget);
                sections.push(format!("{header}{body}\n"));
                evidence_budget_chars = 0;
                included_any = true;
                break;
            } else {
                break;
            }
        }

        if !included_any {
            if let Some(top) = context_chunks.first() {
                let header = format!("[{}] {} ({})\n", top.chunk_id, top.title, top.chunk_type.as_str());
                let body = truncate_preserving_facts(&top.text, MIN_FALLBACK_CHARS);
                sections.push(format!("{header}{body}\n"));
            }
        }

        let mut prompt = String::new();
        prompt.push_str(&preamble);
        for section in &sections {
            prompt.push_str(section);
            prompt.push('\n');
        }
        prompt.push_str(&postamble);
        prompt
    }

    /// Estimated token count of an already-built prompt, for the testable
    /// invariant that output stays within `PROMPT_MAX_TOKENS - PROMPT_RESERVED_ANSWER`.
    pub fn estimate_tokens(prompt: &str) -> usize {
        estimate_tokens(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkType;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            chunk_type: ChunkType::Class,
            title: "Title".to_string(),
            text: text.to_string(),
            metadata: serde_json::json!({}),
            created_at: 0,
        }
    }

    #[test]
    fn output_stays_within_evidence_budget() {
        let assembler = PromptAssembler::new(400, 100, 20);
        let long_text = "word ".repeat(2000);
        let chunks = vec![chunk("a", &long_text)];
        let prompt = assembler.build(&chunks, "What happened?", 4, None, PromptVariant::Strict);
        let tokens = PromptAssembler::estimate_tokens(&prompt);
        assert!(tokens <= 400 - 100, "tokens={tokens}");
    }

    #[test]
    fn zero_chunks_fit_falls_back_to_top_chunk_truncated() {
        let assembler = PromptAssembler::new(50, 10, 5);
        let long_text = "x".repeat(5000);
        let chunks = vec![chunk("only", &long_text)];
        let prompt = assembler.build(&chunks, "Q?", 4, None, PromptVariant::Strict);
        assert!(prompt.contains("[only]"));
    }

    #[test]
    fn fact_lines_preserved_verbatim_under_truncation() {
        let text = format!("{}\nTotal: 42\n{}", "filler ".repeat(500), "tail filler ".repeat(500));
        let truncated = truncate_preserving_facts(&text, 200);
        assert!(truncated.contains("Total: 42"));
    }

    #[test]
    fn strict_variant_mentions_refusal_string() {
        let assembler = PromptAssembler::new(2000, 200, 50);
        let chunks = vec![chunk("a", "some evidence")];
        let prompt = assembler.build(&chunks, "Q?", 4, None, PromptVariant::Strict);
        assert!(prompt.contains(STRICT_REFUSAL));
    }

    #[test]
    fn history_includes_only_last_n_turns_tail_truncated() {
        let assembler = PromptAssembler::new(5000, 200, 50);
        let turns: Vec<Turn> = (0..10)
            .map(|i| Turn {
                role: "user".to_string(),
                content: format!("turn {i}"),
            })
            .collect();
        let chunks = vec![chunk("a", "evidence")];
        let prompt = assembler.build(&chunks, "Q?", 4, Some(&turns), PromptVariant::Strict);
        assert!(prompt.contains("turn 9"));
        assert!(!prompt.contains("turn 0"));
    }
}
