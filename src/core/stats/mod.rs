//! On-demand keyword analytics over persisted responses.
//!
//! Both queries are pure functions of the response-store contents within
//! the requested window; nothing here is persisted.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::core::models::{KeywordCount, KeywordStats, Response, ResponseFilter};
use crate::core::store::Database;

/// Capitalised English function words excluded from candidate keywords.
pub const STOP_WORDS: [&str; 33] = [
    "The", "A", "An", "And", "Or", "But", "In", "On", "At", "To", "For", "Of", "With", "By",
    "From", "This", "That", "These", "Those", "I", "You", "He", "She", "It", "We", "They", "My",
    "Your", "His", "Her", "Its", "Our", "Their",
];

pub struct StatsService {
    store: Arc<dyn Database>,
}

impl StatsService {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Aggregate statistics for one keyword across every matching response
    /// in the (inclusive) window. Matching is case-insensitive substring,
    /// not word-bounded.
    pub async fn search_keyword(
        &self,
        keyword: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<KeywordStats> {
        let filter = ResponseFilter {
            keyword: Some(keyword.to_string()),
            start_time,
            end_time,
            ..Default::default()
        };
        let responses = self.store.list_responses(&filter).await?;
        Ok(aggregate_keyword(keyword, &responses))
    }

    /// The most frequent candidate keywords in the window, descending by
    /// count.
    pub async fn top_keywords(
        &self,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<KeywordCount>> {
        let filter = ResponseFilter {
            start_time,
            end_time,
            ..Default::default()
        };
        let responses = self.store.list_responses(&filter).await?;
        Ok(top_keywords_in(&responses, limit, &STOP_WORDS))
    }

    /// Bulk reset: drop every persisted response.
    pub async fn reset(&self) -> Result<usize> {
        self.store.delete_all_responses().await
    }
}

fn aggregate_keyword(keyword: &str, responses: &[Response]) -> KeywordStats {
    let mut stats = KeywordStats {
        keyword: keyword.to_string(),
        ..Default::default()
    };

    let mut prompts_seen = BTreeSet::new();
    let mut llms_seen = BTreeSet::new();

    for response in responses {
        let count = count_occurrences(&response.response_text, keyword);
        stats.total_mentions += count;

        *stats.by_prompt.entry(response.prompt_id.clone()).or_default() += count;
        prompts_seen.insert(response.prompt_id.clone());

        *stats.by_llm.entry(response.llm_id.clone()).or_default() += count;
        llms_seen.insert(response.llm_id.clone());

        *stats
            .by_provider
            .entry(response.llm_provider.clone())
            .or_default() += count;

        stats.first_seen = match stats.first_seen {
            Some(first) if first <= response.created_at => Some(first),
            _ => Some(response.created_at),
        };
        stats.last_seen = match stats.last_seen {
            Some(last) if last >= response.created_at => Some(last),
            _ => Some(response.created_at),
        };
    }

    stats.unique_prompts = prompts_seen.len();
    stats.unique_llms = llms_seen.len();
    stats
}

fn top_keywords_in(responses: &[Response], limit: usize, stop_words: &[&str]) -> Vec<KeywordCount> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for response in responses {
        for keyword in extract_candidate_keywords(&response.response_text, stop_words) {
            *counts.entry(keyword).or_default() += 1;
        }
    }

    let mut sorted: Vec<KeywordCount> = counts
        .into_iter()
        .map(|(keyword, count)| KeywordCount { keyword, count })
        .collect();
    // Descending by count; ties break alphabetically for stable output.
    sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.keyword.cmp(&b.keyword)));
    sorted.truncate(limit);
    sorted
}

/// Count non-overlapping, case-insensitive occurrences, scanning left to
/// right.
pub fn count_occurrences(text: &str, keyword: &str) -> usize {
    if keyword.is_empty() {
        return 0;
    }

    let haystack = text.to_lowercase();
    let needle = keyword.to_lowercase();

    let mut count = 0;
    let mut index = 0;
    while let Some(found) = haystack[index..].find(&needle) {
        count += 1;
        index += found + needle.len();
    }
    count
}

/// Extract candidate keywords: maximal runs of whitespace-joined tokens
/// each matching `[A-Z][a-zA-Z]+`, minus the stop-list. A multi-token run
/// is kept even when it starts with a stop word ("The Matrix" survives,
/// "The" alone does not).
pub fn extract_candidate_keywords(text: &str, stop_words: &[&str]) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\b[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*\b").unwrap());

    pattern
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|candidate| !stop_words.contains(&candidate.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn response(id: &str, prompt_id: &str, llm_id: &str, provider: &str, text: &str) -> Response {
        Response {
            id: id.to_string(),
            prompt_id: prompt_id.to_string(),
            prompt_text: "prompt".to_string(),
            llm_id: llm_id.to_string(),
            llm_name: "model".to_string(),
            llm_provider: provider.to_string(),
            llm_model: "m".to_string(),
            response_text: text.to_string(),
            temperature: 0.7,
            schedule_id: String::new(),
            tokens_used: 0,
            latency_ms: 0,
            error: String::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn occurrences_are_case_insensitive_and_non_overlapping() {
        assert_eq!(count_occurrences("Netflix and netflix and NETFLIX", "netflix"), 3);
        assert_eq!(count_occurrences("aaaa", "aa"), 2);
        assert_eq!(count_occurrences("nothing here", "netflix"), 0);
        assert_eq!(count_occurrences("anything", ""), 0);
    }

    #[test]
    fn extraction_keeps_capitalised_runs_and_drops_stop_words() {
        let keywords = extract_candidate_keywords(
            "The Matrix is better than Inception. But Netflix has both.",
            &STOP_WORDS,
        );
        assert!(keywords.contains(&"The Matrix".to_string()));
        assert!(keywords.contains(&"Inception".to_string()));
        assert!(keywords.contains(&"Netflix".to_string()));
        assert!(!keywords.contains(&"But".to_string()));
        assert!(!keywords.contains(&"The".to_string()));
    }

    #[test]
    fn extraction_respects_a_custom_stop_list() {
        let extended: Vec<&str> = STOP_WORDS
            .iter()
            .copied()
            .chain(["If", "While", "AI", "What", "CRM", "Here", "URL"])
            .collect();

        let base = extract_candidate_keywords("While Netflix grew", &STOP_WORDS);
        assert!(base.contains(&"While Netflix".to_string()));

        // "While Netflix" is a two-token run, so it survives even the
        // extended list; a lone "While" does not.
        let lone = extract_candidate_keywords("While. Netflix grew", &extended);
        assert!(!lone.contains(&"While".to_string()));
        assert!(lone.contains(&"Netflix".to_string()));
    }

    #[test]
    fn aggregation_tracks_breakdowns_and_seen_window() {
        let mut old = response("r1", "p1", "m1", "openai", "Netflix and Disney");
        old.created_at = Utc::now() - Duration::hours(1);
        let responses = vec![
            old.clone(),
            response("r2", "p2", "m2", "anthropic", "netflix only"),
        ];

        let stats = aggregate_keyword("Netflix", &responses);
        assert_eq!(stats.total_mentions, 2);
        assert_eq!(stats.unique_prompts, 2);
        assert_eq!(stats.unique_llms, 2);
        assert_eq!(stats.by_prompt["p1"], 1);
        assert_eq!(stats.by_prompt["p2"], 1);
        assert_eq!(stats.by_provider["openai"], 1);
        assert_eq!(stats.by_provider["anthropic"], 1);
        assert_eq!(stats.first_seen, Some(old.created_at));
        assert!(stats.last_seen > stats.first_seen);
    }

    #[test]
    fn top_keywords_rank_by_count_descending() {
        let responses = vec![
            response("r1", "p1", "m1", "openai", "Netflix beats Disney"),
            response("r2", "p1", "m2", "openai", "Netflix again"),
            response("r3", "p2", "m1", "openai", "nothing capitalised here"),
        ];

        let top = top_keywords_in(&responses, 2, &STOP_WORDS);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].keyword, "Netflix");
        assert_eq!(top[0].count, 2);
        assert_eq!(top[1].keyword, "Disney");
        assert_eq!(top[1].count, 1);
    }

    #[test]
    fn aggregation_of_nothing_is_empty() {
        let stats = aggregate_keyword("Netflix", &[]);
        assert_eq!(stats.total_mentions, 0);
        assert_eq!(stats.unique_prompts, 0);
        assert!(stats.first_seen.is_none());
        assert!(stats.by_prompt.is_empty());
    }
}
