//! Near-duplicate removal: SimHash bucketing followed by TF-IDF/cosine
//! clustering (spec §4.3). Operates on a minimal `DedupItem` view rather
//! than the full `Article` so it can be unit tested without a database.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// The fields the dedup engine needs from an article. Kept deliberately
/// separate from `crate::models::Article` so this module has no database
/// dependency and its properties (idempotence, determinism) are directly
/// testable.
#[derive(Debug, Clone)]
pub struct DedupItem {
    pub post_id: String,
    pub title: String,
    pub content: String,
    pub simhash: Option<u64>,
    pub relevance_score: f64,
}

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z\p{Cyrillic}0-9]{2,}").unwrap())
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").unwrap())
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

/// Collapses runs of the same repeated punctuation character down to one
/// occurrence. Implemented without regex because the `regex` crate (unlike
/// `fancy-regex`) does not support backreferences, which a pattern like
/// `([[:punct:]])\1+` would require.
fn collapse_punctuation_runs(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if c.is_ascii_punctuation() && prev == Some(c) {
            continue;
        }
        result.push(c);
        prev = Some(c);
    }
    result
}

fn non_word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s]").unwrap())
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Shared normalization primitive (spec §4.3): lowercase, strip URLs and
/// markup, collapse punctuation runs and whitespace, drop everything that
/// isn't a Latin/Cyrillic word character, digit, underscore, or space.
pub fn normalize_text(text: &str) -> String {
    let lower = text.to_lowercase();
    let no_urls = url_pattern().replace_all(&lower, " ");
    let no_tags = tag_pattern().replace_all(&no_urls, " ");
    let collapsed_punct = collapse_punctuation_runs(&no_tags);
    let word_chars_only = non_word_pattern().replace_all(&collapsed_punct, " ");
    whitespace_pattern()
        .replace_all(&word_chars_only, " ")
        .trim()
        .to_string()
}

/// 64-bit SimHash over whitespace-split tokens of the normalized text.
pub fn simhash64(text: &str) -> u64 {
    let normalized = normalize_text(text);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.is_empty() {
        return 0;
    }

    let mut weights = [0i64; 64];
    for token in tokens {
        let hash = fnv1a64(token.as_bytes());
        for bit in 0..64 {
            if (hash >> bit) & 1 == 1 {
                weights[bit] += 1;
            } else {
                weights[bit] -= 1;
            }
        }
    }

    let mut result: u64 = 0;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            result |= 1 << bit;
        }
    }
    result
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// n-gram shape for the TF-IDF vectorizer (spec §4.3: `{1,2,3}` in-batch,
/// `{1,1}` elsewhere).
#[derive(Debug, Clone, Copy)]
pub struct NGramRange {
    pub min: usize,
    pub max: usize,
}

impl NGramRange {
    pub const UNIGRAM: NGramRange = NGramRange { min: 1, max: 1 };
    pub const UP_TO_TRIGRAM: NGramRange = NGramRange { min: 1, max: 3 };
}

/// A bag-of-words/n-grams TF-IDF vectorizer with a bounded vocabulary.
pub struct TfIdfVectorizer {
    ngram_range: NGramRange,
    max_features: usize,
}

impl TfIdfVectorizer {
    pub fn new(ngram_range: NGramRange, max_features: usize) -> Self {
        Self {
            ngram_range,
            max_features,
        }
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let normalized = normalize_text(text);
        let words: Vec<&str> = word_pattern()
            .find_iter(&normalized)
            .map(|m| m.as_str())
            .collect();

        let mut grams = Vec::new();
        for n in self.ngram_range.min..=self.ngram_range.max {
            if n == 0 || n > words.len() {
                continue;
            }
            for window in words.windows(n) {
                grams.push(window.join(" "));
            }
        }
        grams
    }

    /// Fits a vocabulary over all documents and returns a sparse TF-IDF
    /// vector (term-index -> weight) per document, in input order.
    pub fn fit_transform(&self, documents: &[String]) -> Vec<HashMap<usize, f64>> {
        let mut doc_term_counts: Vec<HashMap<String, usize>> = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in documents {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for term in self.tokenize(doc) {
                *counts.entry(term).or_insert(0) += 1;
            }
            for term in counts.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            doc_term_counts.push(counts);
        }

        // Bound vocabulary to max_features by descending document frequency,
        // mirroring scikit-learn's max_features truncation.
        let mut terms: Vec<(&String, &usize)> = doc_freq.iter().collect();
        terms.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        terms.truncate(self.max_features);

        let vocab: HashMap<String, usize> = terms
            .into_iter()
            .enumerate()
            .map(|(idx, (term, _))| (term.clone(), idx))
            .collect();

        let n_docs = documents.len() as f64;
        let idf: HashMap<String, f64> = vocab
            .keys()
            .map(|term| {
                let df = *doc_freq.get(term).unwrap_or(&1) as f64;
                (term.clone(), (n_docs / df).ln() + 1.0)
            })
            .collect();

        doc_term_counts
            .into_iter()
            .map(|counts| {
                let mut vec: HashMap<usize, f64> = HashMap::new();
                for (term, count) in counts {
                    if let (Some(&idx), Some(&term_idf)) = (vocab.get(&term), idf.get(&term)) {
                        vec.insert(idx, count as f64 * term_idf);
                    }
                }
                l2_normalize(&mut vec);
                vec
            })
            .collect()
    }
}

fn l2_normalize(vec: &mut HashMap<usize, f64>) {
    let norm: f64 = vec.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vec.values_mut() {
            *v /= norm;
        }
    }
}

pub fn cosine_similarity(a: &HashMap<usize, f64>, b: &HashMap<usize, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(idx, weight)| large.get(idx).map(|other| weight * other))
        .sum()
}

fn row_sum(vec: &HashMap<usize, f64>) -> f64 {
    vec.values().sum()
}

/// Phase 1 (spec §4.3 "group_by_simhash"): greedy single-pass clustering by
/// Hamming distance, with SimHash-less items routed to their closest group
/// by title+content cosine similarity, and a split-largest-group fallback
/// to reach `min_batches`.
pub fn group_by_simhash(items: &[DedupItem], max_distance: u32, min_batches: usize) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut assigned = vec![false; items.len()];

    let with_hash: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, it)| it.simhash.is_some())
        .map(|(i, _)| i)
        .collect();

    for &i in &with_hash {
        if assigned[i] {
            continue;
        }
        let hash_i = items[i].simhash.unwrap();
        let mut group = vec![i];
        assigned[i] = true;
        for &j in &with_hash {
            if assigned[j] || j <= i {
                continue;
            }
            let hash_j = items[j].simhash.unwrap();
            if hamming_distance(hash_i, hash_j) <= max_distance {
                group.push(j);
                assigned[j] = true;
            }
        }
        groups.push(group);
    }

    // Route SimHash-less items to the closest existing group by TF-IDF
    // cosine similarity against the group's concatenated text.
    let without_hash: Vec<usize> = (0..items.len()).filter(|i| !assigned[*i]).collect();
    if !without_hash.is_empty() {
        if groups.is_empty() {
            for &i in &without_hash {
                groups.push(vec![i]);
                assigned[i] = true;
            }
        } else {
            let vectorizer = TfIdfVectorizer::new(NGramRange::UP_TO_TRIGRAM, 5000);
            let group_texts: Vec<String> = groups
                .iter()
                .map(|g| {
                    g.iter()
                        .map(|&idx| format!("{} {}", items[idx].title, items[idx].content))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            let item_texts: Vec<String> = without_hash
                .iter()
                .map(|&idx| format!("{} {}", items[idx].title, items[idx].content))
                .collect();

            let mut all_docs = group_texts.clone();
            all_docs.extend(item_texts.clone());
            let vectors = vectorizer.fit_transform(&all_docs);
            let group_vectors = &vectors[..group_texts.len()];
            let item_vectors = &vectors[group_texts.len()..];

            for (k, &idx) in without_hash.iter().enumerate() {
                let mut best_group = 0usize;
                let mut best_score = -1.0f64;
                for (g, gv) in group_vectors.iter().enumerate() {
                    let score = cosine_similarity(&item_vectors[k], gv);
                    if score > best_score {
                        best_score = score;
                        best_group = g;
                    }
                }
                groups[best_group].push(idx);
                assigned[idx] = true;
            }
        }
    }

    while groups.len() < min_batches && groups.iter().any(|g| g.len() > 1) {
        let (largest_idx, _) = groups
            .iter()
            .enumerate()
            .max_by_key(|(_, g)| g.len())
            .unwrap();
        let largest = groups.remove(largest_idx);
        let mid = largest.len() / 2;
        let (left, right) = largest.split_at(mid);
        groups.push(left.to_vec());
        groups.push(right.to_vec());
    }

    groups
}

/// Phase 2 (spec §4.3 "deduplicate_batch"): greedy selection by TF-IDF row
/// richness, excluding near-duplicates above `similarity_threshold`.
/// Returns indices into `items` (relative to the slice passed in) that
/// survive. Falls back to the first item when `keep_min_one` is set and the
/// vectorizer produces nothing usable.
pub fn deduplicate_batch(items: &[DedupItem], similarity_threshold: f64, keep_min_one: bool) -> Vec<usize> {
    if items.is_empty() {
        return Vec::new();
    }
    if items.len() == 1 {
        return vec![0];
    }

    let vectorizer = TfIdfVectorizer::new(NGramRange::UP_TO_TRIGRAM, 5000);
    let docs: Vec<String> = items
        .iter()
        .map(|it| normalize_text(&format!("{} {}", it.title, it.content)))
        .collect();
    let vectors = vectorizer.fit_transform(&docs);

    let has_vocab = vectors.iter().any(|v| !v.is_empty());
    if !has_vocab {
        return if keep_min_one { vec![0] } else { Vec::new() };
    }

    let mut scores: Vec<(usize, f64)> = vectors.iter().enumerate().map(|(i, v)| (i, row_sum(v))).collect();
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));

    let mut excluded = vec![false; items.len()];
    let mut selected = Vec::new();

    for (idx, _) in scores {
        if excluded[idx] {
            continue;
        }
        selected.push(idx);
        excluded[idx] = true;
        for other in 0..items.len() {
            if excluded[other] {
                continue;
            }
            if cosine_similarity(&vectors[idx], &vectors[other]) > similarity_threshold {
                excluded[other] = true;
            }
        }
    }

    if selected.is_empty() && keep_min_one {
        return vec![0];
    }
    selected
}

/// Default thresholds from spec §4.3/§4.5.
pub const GROUP_SIMILARITY_THRESHOLD: f64 = 0.65;
pub const GLOBAL_SIMILARITY_THRESHOLD: f64 = 0.60;
pub const SIMHASH_MAX_DISTANCE: u32 = 16;
pub const MIN_BATCHES: usize = 2;
pub const DIVERSIFY_HARD_CAP: f64 = 0.9;
pub const DIVERSIFY_SOFT_CAP: f64 = 0.8;
pub const SUMMARY_TITLE_SIMILARITY_THRESHOLD: f64 = 0.85;
pub const SUMMARY_CONTENT_SIMILARITY_THRESHOLD: f64 = 0.70;

/// Full processing pipeline (spec §4.3 "process_posts"):
/// `group_by_simhash -> deduplicate_batch per group -> concatenate -> deduplicate_batch globally`.
/// Returns the surviving items, cloned, preserving the post_id-keyed
/// identity the caller needs to map back to stored articles.
pub fn process_posts(items: &[DedupItem]) -> Vec<DedupItem> {
    if items.is_empty() {
        return Vec::new();
    }

    let groups = group_by_simhash(items, SIMHASH_MAX_DISTANCE, MIN_BATCHES);

    let mut survivors: Vec<DedupItem> = Vec::new();
    for group in &groups {
        let group_items: Vec<DedupItem> = group.iter().map(|&i| items[i].clone()).collect();
        let kept = deduplicate_batch(&group_items, GROUP_SIMILARITY_THRESHOLD, true);
        survivors.extend(kept.into_iter().map(|i| group_items[i].clone()));
    }

    let final_kept = deduplicate_batch(&survivors, GLOBAL_SIMILARITY_THRESHOLD, true);
    final_kept.into_iter().map(|i| survivors[i].clone()).collect()
}

/// Diversification (spec §4.3 "select_top_N"): drop near-duplicates of
/// already-accepted items at a hard cap, then greedily accept by
/// `relevance_score` under a softer pairwise cap, up to `n`.
pub fn select_top_n(items: &[DedupItem], n: usize) -> Vec<DedupItem> {
    if items.is_empty() || n == 0 {
        return Vec::new();
    }

    let vectorizer = TfIdfVectorizer::new(NGramRange::UNIGRAM, 5000);
    let docs: Vec<String> = items
        .iter()
        .map(|it| normalize_text(&format!("{} {}", it.title, it.content)))
        .collect();
    let vectors = vectorizer.fit_transform(&docs);

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        items[b]
            .relevance_score
            .partial_cmp(&items[a].relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut accepted: Vec<usize> = Vec::new();
    for &idx in &order {
        if accepted.len() >= n {
            break;
        }
        let too_close_to_any_hard = accepted
            .iter()
            .any(|&a| cosine_similarity(&vectors[idx], &vectors[a]) >= DIVERSIFY_HARD_CAP);
        if too_close_to_any_hard {
            continue;
        }
        let too_close_to_any_soft = accepted
            .iter()
            .any(|&a| cosine_similarity(&vectors[idx], &vectors[a]) >= DIVERSIFY_SOFT_CAP);
        if too_close_to_any_soft {
            continue;
        }
        accepted.push(idx);
    }

    accepted.into_iter().map(|i| items[i].clone()).collect()
}

/// Final dedup over generated summaries (spec §4.5 step 8): title and
/// content (here, the summary text) are compared independently against
/// each other item's, each with its own threshold, rather than a single
/// combined title+content score. Greedy over the input order, so callers
/// should pass items already ranked best-first (as `select_top_n` returns
/// them) so the higher-ranked item of a collapsing pair survives.
pub fn deduplicate_summaries(items: &[DedupItem]) -> Vec<DedupItem> {
    if items.len() <= 1 {
        return items.to_vec();
    }

    let title_vectorizer = TfIdfVectorizer::new(NGramRange::UNIGRAM, 5000);
    let content_vectorizer = TfIdfVectorizer::new(NGramRange::UNIGRAM, 5000);
    let titles: Vec<String> = items.iter().map(|it| it.title.clone()).collect();
    let contents: Vec<String> = items.iter().map(|it| it.content.clone()).collect();
    let title_vectors = title_vectorizer.fit_transform(&titles);
    let content_vectors = content_vectorizer.fit_transform(&contents);

    let mut excluded = vec![false; items.len()];
    let mut selected = Vec::new();

    for i in 0..items.len() {
        if excluded[i] {
            continue;
        }
        selected.push(i);
        for j in (i + 1)..items.len() {
            if excluded[j] {
                continue;
            }
            let title_sim = cosine_similarity(&title_vectors[i], &title_vectors[j]);
            let content_sim = cosine_similarity(&content_vectors[i], &content_vectors[j]);
            if title_sim >= SUMMARY_TITLE_SIMILARITY_THRESHOLD
                || content_sim >= SUMMARY_CONTENT_SIMILARITY_THRESHOLD
            {
                excluded[j] = true;
            }
        }
    }

    selected.into_iter().map(|i| items[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let s = "Hello <b>World</b>!!! Visit https://example.com/page now.";
        let once = normalize_text(s);
        let twice = normalize_text(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn simhash_self_distance_is_zero() {
        let s = "sanctions compliance update for regional banks";
        assert_eq!(hamming_distance(simhash64(s), simhash64(s)), 0);
    }

    #[test]
    fn simhash_differs_for_unrelated_text() {
        let a = simhash64("OFAC sanctions list update for regional banks in 2026");
        let b = simhash64("local football club wins championship after extra time");
        assert!(hamming_distance(a, b) > 0);
    }

    #[test]
    fn process_posts_is_idempotent_on_set_equality() {
        let items = vec![
            DedupItem {
                post_id: "a".into(),
                title: "OFAC sanctions update".into(),
                content: "Regulators announced new sanctions against several entities today.".into(),
                simhash: Some(simhash64("OFAC sanctions update regulators announced new sanctions")),
                relevance_score: 0.9,
            },
            DedupItem {
                post_id: "b".into(),
                title: "Sports news".into(),
                content: "The local team won the championship game last night.".into(),
                simhash: Some(simhash64("Sports news local team won championship game")),
                relevance_score: 0.2,
            },
        ];

        let once = process_posts(&items);
        let once_ids: std::collections::HashSet<_> = once.iter().map(|i| i.post_id.clone()).collect();
        let twice = process_posts(&once);
        let twice_ids: std::collections::HashSet<_> = twice.iter().map(|i| i.post_id.clone()).collect();
        assert_eq!(once_ids, twice_ids);
    }

    #[test]
    fn empty_input_produces_empty_output() {
        assert!(process_posts(&[]).is_empty());
        assert!(select_top_n(&[], 5).is_empty());
        assert!(group_by_simhash(&[], 16, 2).is_empty());
    }

    #[test]
    fn single_item_batch_survives_unchanged() {
        let items = vec![DedupItem {
            post_id: "only".into(),
            title: "Solo article".into(),
            content: "Just one article in this batch.".into(),
            simhash: Some(simhash64("solo article just one in this batch")),
            relevance_score: 0.5,
        }];
        let kept = deduplicate_batch(&items, 0.65, true);
        assert_eq!(kept, vec![0]);
    }

    #[test]
    fn near_duplicate_pair_collapses_to_one() {
        let shared = "Regulators in several jurisdictions announced coordinated sanctions against a network of shell companies used for money laundering and reputation management services.";
        let items = vec![
            DedupItem {
                post_id: "x".into(),
                title: "Sanctions network uncovered".into(),
                content: shared.to_string(),
                simhash: Some(simhash64(shared)),
                relevance_score: 0.81,
            },
            DedupItem {
                post_id: "y".into(),
                title: "Sanctions network uncovered again".into(),
                content: format!("{shared} Additional reporting confirmed the same facts."),
                simhash: Some(simhash64(shared)),
                relevance_score: 0.77,
            },
        ];
        let result = process_posts(&items);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn select_top_n_respects_cap() {
        let items: Vec<DedupItem> = (0..10)
            .map(|i| DedupItem {
                post_id: format!("p{i}"),
                title: format!("Distinct story number {i} about compliance topic {i}"),
                content: format!("Unique content body number {i} discussing topic area {i} in depth."),
                simhash: Some(simhash64(&format!("story {i} unique content"))),
                relevance_score: 1.0 - (i as f64) * 0.05,
            })
            .collect();
        let top = select_top_n(&items, 7);
        assert!(top.len() <= 7);
    }

    #[test]
    fn deduplicate_summaries_collapses_near_identical_titles() {
        let items = vec![
            DedupItem {
                post_id: "a".into(),
                title: "Regulator fines bank over AML failures".into(),
                content: "The regulator imposed a significant fine after finding AML control gaps.".into(),
                simhash: None,
                relevance_score: 0.9,
            },
            DedupItem {
                post_id: "b".into(),
                title: "Regulator fines bank for AML failures".into(),
                content: "A different summary, worded another way, about an unrelated enforcement case.".into(),
                simhash: None,
                relevance_score: 0.8,
            },
        ];
        let result = deduplicate_summaries(&items);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].post_id, "a");
    }

    #[test]
    fn deduplicate_summaries_keeps_distinct_stories() {
        let items = vec![
            DedupItem {
                post_id: "a".into(),
                title: "Regulator fines bank over AML failures".into(),
                content: "The regulator imposed a fine after finding control gaps.".into(),
                simhash: None,
                relevance_score: 0.9,
            },
            DedupItem {
                post_id: "b".into(),
                title: "Search engine updates ranking algorithm".into(),
                content: "The update changes how reputation signals affect ranking.".into(),
                simhash: None,
                relevance_score: 0.8,
            },
        ];
        let result = deduplicate_summaries(&items);
        assert_eq!(result.len(), 2);
    }
}
