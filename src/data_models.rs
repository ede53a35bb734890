use serde::{Deserialize, Serialize};

/// One hit from the external search collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl SearchResult {
    pub fn new(title: impl Into<String>, url: impl Into<String>, snippet: impl Into<String>) -> Self {
        SearchResult {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
        }
    }
}

/// A processable response. `url` is the final URL after redirects,
/// `requested_url` the input that produced it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub requested_url: String,
    pub html: String,
    pub status_code: u16,
    pub content_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtractedContent {
    pub url: String,
    pub title: String,
    pub text: String,
}

impl ExtractedContent {
    pub fn new(url: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        ExtractedContent {
            url: url.into(),
            title: title.into(),
            text: text.into(),
        }
    }

    /// True when the text came from a search snippet rather than the page.
    pub fn is_snippet(&self) -> bool {
        self.text.starts_with(crate::recovery::SNIPPET_MARKER)
    }
}

/// A bounded slice of one source's text. Several chunks may share a url.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chunk {
    pub url: String,
    pub title: String,
    pub text: String,
    pub index: usize,
}

/// Judge verdict for a single chunk. `score` is always within 1..=5.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceScore {
    pub url: String,
    pub title: String,
    pub score: u8,
    pub explanation: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkSummary {
    pub score: u8,
    pub explanation: String,
}

/// All chunk verdicts of one url collapsed into one. `score` is the max.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceAggregate {
    pub url: String,
    pub title: String,
    pub score: u8,
    pub explanation: String,
    pub chunk_count: usize,
    pub chunk_summaries: Vec<ChunkSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    InsufficientData,
    ShortReport,
    FullReport,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::InsufficientData => "insufficient_data",
            Decision::ShortReport => "short_report",
            Decision::FullReport => "full_report",
        }
    }
}

/// Outcome of the relevance gate, handed to the synthesis collaborator.
///
/// A url's chunks are either all in `surviving_chunks` or none are.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelevanceEvaluation {
    pub decision: Decision,
    pub rationale: String,
    pub surviving_chunks: Vec<Chunk>,
    pub surviving_sources: Vec<SourceAggregate>,
    pub dropped_sources: Vec<SourceAggregate>,
    pub total_scored: usize,
    pub total_survived: usize,
    pub refined_query: String,
}
