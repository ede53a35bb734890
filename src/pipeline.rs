use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;

use crate::config::{FetchConfig, RelevanceConfig};
use crate::data_models::{ExtractedContent, RelevanceEvaluation, SearchResult};
use crate::extraction::{Chunker, ContentExtractor};
use crate::fetcher::Fetcher;
use crate::recovery::RecoveryEngine;
use crate::relevance::{RelevanceScorer, evaluate_sources};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub evaluation: RelevanceEvaluation,
    pub contents: Vec<ExtractedContent>,
    pub recovered_urls: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// search results -> fetch -> extract -> recover -> chunk -> score -> gate.
pub struct ResearchPipeline {
    pub fetcher: Fetcher,
    pub fetch: FetchConfig,
    pub extractor: Arc<dyn ContentExtractor>,
    pub recovery: RecoveryEngine,
    pub chunker: Chunker,
    pub scorer: RelevanceScorer,
    pub relevance: RelevanceConfig,
}

impl ResearchPipeline {
    /// Never fails on thin or hostile content: the worst outcome is an
    /// `insufficient_data` evaluation.
    pub async fn run(
        &self,
        query: &str,
        refined_query: Option<&str>,
        search_results: &[SearchResult],
    ) -> PipelineOutcome {
        let run_id = nanoid::nanoid!(8);
        let span = tracing::info_span!("research_run", run_id = %run_id);
        self.run_inner(query, refined_query, search_results)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        query: &str,
        refined_query: Option<&str>,
        search_results: &[SearchResult],
    ) -> PipelineOutcome {
        let urls = candidate_urls(search_results, self.relevance.max_sources());
        log::info!(
            "processing {} of {} search results",
            urls.len(),
            search_results.len()
        );

        let fetched = self
            .fetcher
            .fetch_all_with_aliases(&urls, self.fetch.timeout, self.fetch.max_concurrent)
            .await;

        let mut contents: Vec<ExtractedContent> = Vec::new();
        // An alias shares its document with another input, which owns both
        // extraction and recovery for it.
        let mut succeeded: HashSet<&str> = fetched
            .aliases
            .iter()
            .map(|a| a.requested_url.as_str())
            .collect();
        let mut content_urls: HashSet<String> = HashSet::new();
        for page in &fetched.pages {
            if let Some(content) = self.extractor.extract(page) {
                succeeded.insert(page.requested_url.as_str());
                if content_urls.insert(content.url.clone()) {
                    contents.push(content);
                }
            }
        }

        let failed: Vec<String> = urls
            .iter()
            .filter(|u| !succeeded.contains(u.as_str()))
            .cloned()
            .collect();
        let mut recovered_urls = Vec::new();
        if !failed.is_empty() {
            log::info!("{} urls failed direct fetch, starting recovery", failed.len());
            for content in self.recovery.recover(&failed, search_results).await {
                if content_urls.insert(content.url.clone()) {
                    recovered_urls.push(content.url.clone());
                    contents.push(content);
                }
            }
        }

        let chunks = self.chunker.chunk_all(&contents);
        log::info!("{} sources produced {} chunks", contents.len(), chunks.len());

        let evaluation =
            evaluate_sources(query, refined_query, &chunks, &self.scorer, &self.relevance).await;

        PipelineOutcome {
            evaluation,
            contents,
            recovered_urls,
            completed_at: Utc::now(),
        }
    }
}

/// Unique result urls in search order, capped at `max_sources`.
pub fn candidate_urls(search_results: &[SearchResult], max_sources: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    search_results
        .iter()
        .map(|r| r.url.trim())
        .filter(|u| !u.is_empty())
        .filter(|u| seen.insert(*u))
        .take(max_sources)
        .map(str::to_string)
        .collect()
}

#[test]
fn test_candidate_urls_dedupes_and_caps() {
    let results = vec![
        SearchResult::new("a", "https://a.example/", ""),
        SearchResult::new("a again", "https://a.example/", ""),
        SearchResult::new("blank", "  ", ""),
        SearchResult::new("b", "https://b.example/", ""),
        SearchResult::new("c", "https://c.example/", ""),
    ];
    assert_eq!(
        candidate_urls(&results, 2),
        vec!["https://a.example/".to_string(), "https://b.example/".to_string()]
    );
    assert_eq!(candidate_urls(&results, 10).len(), 3);
}
