use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use sourcegate::config::{CONFIG, FetchConfig, RecoveryConfig, ResearchMode, ScoringConfig};
use sourcegate::data_models::SearchResult;
use sourcegate::extraction::{Chunker, HtmlExtractor};
use sourcegate::fetcher::Fetcher;
use sourcegate::judge::AnthropicJudge;
use sourcegate::pipeline::ResearchPipeline;
use sourcegate::recovery::RecoveryEngine;
use sourcegate::relevance::RelevanceScorer;

#[derive(Parser, Debug)]
#[command(about = "Fetch sources for a research query and decide whether they support a report")]
struct Args {
    /// Research question the sources are judged against.
    #[arg(long)]
    query: String,

    /// Narrower query used for scoring instead of --query.
    #[arg(long)]
    refined_query: Option<String>,

    /// Source url; repeat for several.
    #[arg(long = "url", required = true)]
    urls: Vec<String>,

    /// quick, standard or deep. Defaults to RESEARCH_MODE.
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber (also picks up log crate records)
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(true)
        .init();

    let args = Args::parse();
    let mode: ResearchMode = args
        .mode
        .as_deref()
        .unwrap_or(CONFIG.research_mode.as_str())
        .parse()?;

    let api_key = CONFIG
        .anthropic_api_key
        .clone()
        .context("ANTHROPIC_API_KEY is required")?;
    let judge = AnthropicJudge::new(api_key, CONFIG.judge_base_url.clone())?;

    let pipeline = ResearchPipeline {
        fetcher: Fetcher::new()?,
        fetch: FetchConfig::default(),
        extractor: Arc::new(HtmlExtractor::default()),
        recovery: RecoveryEngine::new(RecoveryConfig::from_env())?,
        chunker: Chunker::default(),
        scorer: RelevanceScorer::new(Arc::new(judge), ScoringConfig::from_env()),
        relevance: mode.relevance()?,
    };

    let results: Vec<SearchResult> = args
        .urls
        .iter()
        .map(|u| SearchResult::new("", u.as_str(), ""))
        .collect();
    let outcome = pipeline
        .run(&args.query, args.refined_query.as_deref(), &results)
        .await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
