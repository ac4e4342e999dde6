//! Hybrid-search primitives
//!
//! The store retrieves two ranked candidate arms, cosine similarity over
//! embeddings and full-text rank, and this module fuses them with
//! Reciprocal Rank Fusion. It also hosts the web-search query grammar
//! (`OR`, quoted phrases, leading `-` negation) and its FTS5 translation.

use std::collections::HashMap;
use std::hash::Hash;

/// Default RRF constant
pub const RRF_K: f64 = 60.0;

/// Retrieval mode of a hybrid search call
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Vector,
    Fts,
    Hybrid,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Hybrid
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot_product / (norm_a * norm_b)) as f64
    }
}

/// Cosine distance, the clustering metric
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

/// Fuse the two ranked arms of a hybrid search
///
/// `vector_ranked` and `fts_ranked` are ordered best-first and already
/// truncated to their top-3k candidates. `tie_key` orders equal-score rows;
/// the larger key wins (newest `created_at`, then larger primary key).
pub fn reciprocal_rank_fusion<K, F, T>(
    mode: SearchMode,
    vector_ranked: &[(K, f64)],
    fts_ranked: &[(K, f64)],
    k: usize,
    rrf_k: f64,
    tie_key: F,
) -> Vec<(K, f64)>
where
    K: Clone + Eq + Hash,
    F: Fn(&K) -> T,
    T: Ord,
{
    let vector_ranks: HashMap<&K, (usize, f64)> = vector_ranked
        .iter()
        .enumerate()
        .map(|(rank, (key, score))| (key, (rank + 1, *score)))
        .collect();
    let fts_ranks: HashMap<&K, (usize, f64)> = fts_ranked
        .iter()
        .enumerate()
        .map(|(rank, (key, score))| (key, (rank + 1, *score)))
        .collect();

    let mut scored: Vec<(K, f64)> = match mode {
        SearchMode::Vector => vector_ranked.to_vec(),
        SearchMode::Fts => fts_ranked.to_vec(),
        SearchMode::Hybrid => {
            // Full outer join by key; a missing side contributes 0
            let mut keys: Vec<&K> = vector_ranked.iter().map(|(k, _)| k).collect();
            for (key, _) in fts_ranked {
                if !vector_ranks.contains_key(key) {
                    keys.push(key);
                }
            }
            keys.into_iter()
                .map(|key| {
                    let mut score = 0.0;
                    if let Some((rank, _)) = vector_ranks.get(key) {
                        score += 1.0 / (rrf_k + *rank as f64);
                    }
                    if let Some((rank, _)) = fts_ranks.get(key) {
                        score += 1.0 / (rrf_k + *rank as f64);
                    }
                    (key.clone(), score)
                })
                .collect()
        }
    };

    scored.sort_by(|(a_key, a_score), (b_key, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_key(b_key).cmp(&tie_key(a_key)))
    });
    scored.truncate(k);
    scored
}

/// One positive or negated term of a query group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTerm {
    Word(String),
    Phrase(String),
}

impl QueryTerm {
    fn text(&self) -> &str {
        match self {
            QueryTerm::Word(w) => w,
            QueryTerm::Phrase(p) => p,
        }
    }
}

/// A conjunction of terms; groups are OR-ed together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryGroup {
    pub must: Vec<QueryTerm>,
    pub must_not: Vec<QueryTerm>,
}

/// A parsed web-search-style query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    pub groups: Vec<QueryGroup>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.must.is_empty())
    }

    /// Translate to an FTS5 MATCH expression
    ///
    /// Groups join with `OR`; positive terms within a group are implicit
    /// AND; negations chain through FTS5's binary `NOT`. A group without
    /// positive terms cannot be expressed in FTS5 and is dropped. Returns
    /// `None` when nothing expressible remains.
    pub fn to_fts5(&self) -> Option<String> {
        let rendered: Vec<String> = self
            .groups
            .iter()
            .filter(|group| !group.must.is_empty())
            .map(|group| {
                let mut expr = group
                    .must
                    .iter()
                    .map(|t| quote_fts5(t.text()))
                    .collect::<Vec<_>>()
                    .join(" ");
                for term in &group.must_not {
                    expr = format!("({expr}) NOT {}", quote_fts5(term.text()));
                }
                expr
            })
            .collect();

        if rendered.is_empty() {
            None
        } else if let [single] = rendered.as_slice() {
            Some(single.clone())
        } else {
            Some(
                rendered
                    .into_iter()
                    .map(|g| format!("({g})"))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            )
        }
    }

    /// Reference matcher over plain text, used by tests and the in-memory
    /// scoring fallback
    pub fn matches(&self, text: &str) -> bool {
        let haystack = text.to_lowercase();
        self.groups.iter().any(|group| {
            !group.must.is_empty()
                && group
                    .must
                    .iter()
                    .all(|t| haystack.contains(&t.text().to_lowercase()))
                && group
                    .must_not
                    .iter()
                    .all(|t| !haystack.contains(&t.text().to_lowercase()))
        })
    }
}

fn quote_fts5(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Parse a web-search-style query: whitespace-separated words, `"quoted
/// phrases"`, leading `-` negation, and bare `OR` between groups
pub fn parse_query(text: &str) -> ParsedQuery {
    let mut groups = Vec::new();
    let mut current = QueryGroup::default();

    let mut chars = text.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };

        let negated = first == '-';
        if negated {
            chars.next();
        }

        let term = if matches!(chars.peek(), Some(&'"')) {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            if phrase.is_empty() {
                continue;
            }
            QueryTerm::Phrase(phrase)
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            if word.is_empty() {
                continue;
            }
            if word == "OR" && !negated {
                if !current.must.is_empty() || !current.must_not.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                continue;
            }
            QueryTerm::Word(word)
        };

        if negated {
            current.must_not.push(term);
        } else {
            current.must.push(term);
        }
    }

    if !current.must.is_empty() || !current.must_not.is_empty() {
        groups.push(current);
    }

    ParsedQuery { groups }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_parse_plain_terms() {
        let parsed = parse_query("blue shirts");
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(
            parsed.groups[0].must,
            vec![
                QueryTerm::Word("blue".to_string()),
                QueryTerm::Word("shirts".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_phrase_negation_or() {
        let parsed = parse_query("\"concise answers\" -verbose OR summary");
        assert_eq!(parsed.groups.len(), 2);
        assert_eq!(
            parsed.groups[0].must,
            vec![QueryTerm::Phrase("concise answers".to_string())]
        );
        assert_eq!(
            parsed.groups[0].must_not,
            vec![QueryTerm::Word("verbose".to_string())]
        );
        assert_eq!(
            parsed.groups[1].must,
            vec![QueryTerm::Word("summary".to_string())]
        );
    }

    #[test]
    fn test_fts5_translation() {
        let parsed = parse_query("\"blue shirts\" -formal OR casual");
        assert_eq!(
            parsed.to_fts5().unwrap(),
            "((\"blue shirts\") NOT \"formal\") OR (\"casual\")"
        );

        let single = parse_query("blue shirts");
        assert_eq!(single.to_fts5().unwrap(), "\"blue\" \"shirts\"");

        // Pure negation cannot be expressed
        assert_eq!(parse_query("-formal").to_fts5(), None);
    }

    #[test]
    fn test_reference_matcher() {
        let parsed = parse_query("blue -formal OR casual");
        assert!(parsed.matches("I like blue shirts"));
        assert!(!parsed.matches("blue formal wear"));
        assert!(parsed.matches("casual formal wear"));
        assert!(!parsed.matches("red shirts"));
    }

    #[test]
    fn test_rrf_hybrid_fusion() {
        // p1 is first by vector, p2 first by fts; p1 also appears second
        // in the fts arm so it should win overall
        let vector = vec![("p1", 0.9), ("p3", 0.5)];
        let fts = vec![("p2", 4.0), ("p1", 2.0)];
        let fused = reciprocal_rank_fusion(SearchMode::Hybrid, &vector, &fts, 10, RRF_K, |_| 0);
        assert_eq!(fused[0].0, "p1");
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].1 - expected).abs() < 1e-12);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn test_rrf_single_modes() {
        let vector = vec![("a", 0.9), ("b", 0.8)];
        let fts = vec![("b", 3.0)];
        let v = reciprocal_rank_fusion(SearchMode::Vector, &vector, &fts, 10, RRF_K, |_| 0);
        assert_eq!(v[0], ("a", 0.9));
        let f = reciprocal_rank_fusion(SearchMode::Fts, &vector, &fts, 10, RRF_K, |_| 0);
        assert_eq!(f, vec![("b", 3.0)]);
    }

    #[test]
    fn test_rrf_tie_break_prefers_larger_key() {
        // Same combined score; the larger tie key must come first
        let vector = vec![("old", 0.9), ("new", 0.9)];
        let fts: Vec<(&str, f64)> = Vec::new();
        let tie = |key: &&str| if *key == "new" { 2 } else { 1 };
        let fused = reciprocal_rank_fusion(SearchMode::Vector, &vector, &fts, 10, RRF_K, tie);
        assert_eq!(fused[0].0, "new");
    }

    #[test]
    fn test_rrf_truncates_to_k() {
        let vector: Vec<(i32, f64)> = (0..10).map(|i| (i, 1.0 - i as f64 * 0.01)).collect();
        let fused =
            reciprocal_rank_fusion(SearchMode::Vector, &vector, &[], 3, RRF_K, |k| -*k);
        assert_eq!(fused.len(), 3);
    }
}
