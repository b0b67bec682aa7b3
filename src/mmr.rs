//! Maximal Marginal Relevance diversification.
//!
//! Pure function, no I/O: greedily selects a diverse top-`k` subset of
//! candidates, trading off query relevance against redundancy with what has
//! already been selected.

use crate::models::Candidate;

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= 1e-9 || norm_b <= 1e-9 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Similarity between a candidate and the query vector. Candidates with a
/// missing vector are treated as having zero similarity to everything.
fn sim_to_query(c: &Candidate, query_vec: &[f32]) -> f32 {
    match &c.vector {
        Some(v) => cosine(v, query_vec),
        None => 0.0,
    }
}

fn sim_between(a: &Candidate, b: &Candidate) -> f32 {
    match (&a.vector, &b.vector) {
        (Some(va), Some(vb)) => cosine(va, vb),
        _ => 0.0,
    }
}

/// Greedy MMR selection. Seeds with the highest-cosine-to-query candidate,
/// then repeatedly adds the candidate maximizing
/// `lambda * sim(c, q) - (1 - lambda) * max_{s in selected} sim(c, s)`
/// until `k` are selected or candidates are exhausted. Ties are broken by
/// first occurrence in `candidates` (stable).
pub fn mmr_select(candidates: &[Candidate], query_vec: &[f32], k: usize, lambda: f32) -> Vec<Candidate> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let relevances: Vec<f32> = candidates.iter().map(|c| sim_to_query(c, query_vec)).collect();

    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(candidates.len()));

    // Seed with the candidate of highest cosine to the query. Strict `>`
    // keeps the first occurrence on ties (stable).
    let mut seed_pos = 0;
    let mut seed_score = f32::NEG_INFINITY;
    for (pos, &idx) in remaining.iter().enumerate() {
        if relevances[idx] > seed_score {
            seed_score = relevances[idx];
            seed_pos = pos;
        }
    }
    selected.push(remaining.remove(seed_pos));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (pos, &idx) in remaining.iter().enumerate() {
            let max_sim_to_selected = selected
                .iter()
                .map(|&s| sim_between(&candidates[idx], &candidates[s]))
                .fold(f32::MIN, f32::max);
            let score = lambda * relevances[idx] - (1.0 - lambda) * max_sim_to_selected;

            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }

        selected.push(remaining.remove(best_pos));
    }

    selected.into_iter().map(|i| candidates[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, vec: Vec<f32>) -> Candidate {
        Candidate {
            chunk_id: id.to_string(),
            score: 0.0,
            vector: Some(vec),
            payload: None,
        }
    }

    #[test]
    fn empty_candidates_returns_empty() {
        assert!(mmr_select(&[], &[1.0, 0.0], 5, 0.5).is_empty());
    }

    #[test]
    fn k_zero_returns_empty() {
        let cands = vec![cand("a", vec![1.0, 0.0])];
        assert!(mmr_select(&cands, &[1.0, 0.0], 0, 0.5).is_empty());
    }

    #[test]
    fn output_length_is_min_k_and_input_len() {
        let cands = vec![cand("a", vec![1.0, 0.0]), cand("b", vec![0.0, 1.0])];
        let out = mmr_select(&cands, &[1.0, 0.0], 10, 0.5);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn no_duplicates_and_subset_of_input() {
        let cands = vec![
            cand("a", vec![1.0, 0.0]),
            cand("b", vec![0.9, 0.1]),
            cand("c", vec![0.0, 1.0]),
        ];
        let out = mmr_select(&cands, &[1.0, 0.0], 3, 0.5);
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn lambda_one_orders_by_query_similarity_descending() {
        let cands = vec![
            cand("low", vec![0.1, 0.99]),
            cand("high", vec![0.99, 0.1]),
            cand("mid", vec![0.6, 0.6]),
        ];
        let out = mmr_select(&cands, &[1.0, 0.0], 3, 1.0);
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn missing_vector_treated_as_zero_similarity() {
        let cands = vec![
            Candidate {
                chunk_id: "novec".to_string(),
                score: 0.0,
                vector: None,
                payload: None,
            },
            cand("a", vec![1.0, 0.0]),
        ];
        let out = mmr_select(&cands, &[1.0, 0.0], 2, 1.0);
        // "a" has higher similarity to the query than "novec" (treated as 0).
        assert_eq!(out[0].chunk_id, "a");
    }
}
