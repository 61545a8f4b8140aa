use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::engine::{DecisionEngine, DecisionRequest};
use crate::ensemble::EnsembleScorer;
use crate::indexer::{ConsistencyValidator, Ingestor};
use crate::inference::InferenceClient;
use crate::store::{SearchFilter, VectorStoreCoordinator};
use crate::telemetry::Telemetry;

async fn build_stack(
    config: &Config,
) -> Result<(Arc<VectorStoreCoordinator>, InferenceClient, Arc<Telemetry>)> {
    let telemetry = Telemetry::new();
    let coordinator = Arc::new(
        VectorStoreCoordinator::open(config, telemetry.clone())
            .await
            .context("Failed to open vector stores")?,
    );
    let client = InferenceClient::new(config, telemetry.clone())
        .context("Failed to create inference client")?;
    Ok((coordinator, client, telemetry))
}

/// Write the default configuration file if none exists yet.
#[inline]
pub fn init_config() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    config.save().context("Failed to save configuration")?;

    eprintln!(
        "{}",
        style("Configuration written. Edit config.toml to adjust, or run with --show to review.")
            .green()
    );
    Ok(())
}

#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;

    eprintln!("{}", style("Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Inference Gateway:").bold().yellow());
    eprintln!("  Host: {}", style(&config.inference.host).cyan());
    eprintln!("  Port: {}", style(config.inference.port).cyan());
    eprintln!("  Embed model: {}", style(&config.inference.embed_model).cyan());
    eprintln!(
        "  Classify model: {}",
        style(&config.inference.classify_model).cyan()
    );
    eprintln!(
        "  Generate model: {}",
        style(&config.inference.generate_model).cyan()
    );
    match config.inference.gateway_url() {
        Ok(url) => eprintln!("  Gateway URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Gateway URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Index:").bold().yellow());
    eprintln!("  Dimension: {}", style(config.index.dimension).cyan());
    eprintln!("  Metric: {:?}", style(config.index.metric).cyan());

    eprintln!();
    eprintln!("{}", style("Ensemble:").bold().yellow());
    eprintln!(
        "  Flag threshold: {}",
        style(config.ensemble.flag_threshold).cyan()
    );
    for (name, settings) in &config.ensemble.signals {
        eprintln!(
            "  {}: weight {}, ceiling {}",
            name,
            style(settings.weight).cyan(),
            style(settings.hard_ceiling).cyan()
        );
    }

    eprintln!();
    eprintln!(
        "Data directory: {}",
        style(config.base_dir.display()).dim()
    );

    Ok(())
}

/// Ingest a document file into the retrieval stores.
#[inline]
pub async fn ingest(
    file: &Path,
    document_id: Option<String>,
    policy_type: Option<String>,
) -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let document_id = document_id.unwrap_or_else(|| {
        file.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string())
    });

    info!("Ingesting document '{}'", document_id);

    let (coordinator, client, _telemetry) = build_stack(&config).await?;
    let ingestor = Ingestor::new(coordinator, client, config.chunking.clone());

    let report = ingestor
        .ingest(&document_id, &text, policy_type.as_deref())
        .await?;

    println!("Ingested document: {}", report.document_id);
    println!("  Chunks: {}", report.chunks_total);
    println!("  Newly indexed: {}", report.chunks_indexed);
    println!("  Already present: {}", report.chunks_skipped);

    Ok(())
}

/// Semantic search over the indexed documents.
#[inline]
pub async fn query(text: &str, limit: usize, document: Option<String>) -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let (coordinator, client, _telemetry) = build_stack(&config).await?;

    let query_text = text.to_string();
    let embed_client = client.clone();
    let embedding = tokio::task::spawn_blocking(move || embed_client.embed(&query_text))
        .await
        .context("Embedding task failed")??;

    let filter = SearchFilter {
        document_id: document,
        ..SearchFilter::default()
    };
    let results = coordinator
        .search_filtered(&embedding, limit, &filter)
        .await?;

    if results.is_empty() {
        println!("No matching chunks.");
        return Ok(());
    }

    for (rank, chunk) in results.iter().enumerate() {
        println!(
            "{} {} (distance {:.4})",
            style(format!("{}.", rank + 1)).bold(),
            style(chunk.chunk_id()).cyan(),
            chunk.distance
        );
        println!("   {}", chunk.content.replace('\n', "\n   "));
    }

    Ok(())
}

/// Assess a claim described by a JSON file and print the decision.
#[inline]
pub async fn assess(file: &Path) -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request: DecisionRequest = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse claim request from {}", file.display()))?;

    let (coordinator, client, _telemetry) = build_stack(&config).await?;
    let scorer = EnsembleScorer::new(config.ensemble.clone(), client.clone())?;
    let engine = DecisionEngine::new(coordinator, client, scorer, config.policy.clone());

    let decision = engine.decide(request).await?;

    let verdict = match decision.verdict {
        crate::engine::VerdictKind::Approve => style(decision.verdict.to_string()).green(),
        crate::engine::VerdictKind::Reject => style(decision.verdict.to_string()).red(),
        crate::engine::VerdictKind::Review => style(decision.verdict.to_string()).yellow(),
    };
    eprintln!(
        "{} (risk {:.1}, confidence {:.2})",
        verdict.bold(),
        decision.risk_score,
        decision.confidence
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&decision).context("Failed to serialize decision")?
    );

    Ok(())
}

/// Show store statistics and gateway health.
#[inline]
pub async fn show_status() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    let (coordinator, client, telemetry) = build_stack(&config).await?;

    let stats = coordinator.stats().await?;

    println!("{}", style("Store").bold());
    println!("  Documents: {}", stats.documents);
    println!("  Active chunks: {}", stats.active_chunks);
    println!("  Pending chunks: {}", stats.pending_chunks);
    println!("  Awaiting repair: {}", stats.pending_repair_chunks);
    println!("  Index rows: {}", stats.ann_rows);
    println!("  Generation: {}", stats.generation);
    println!("  Dimension: {}", stats.dimension);
    if stats.rebuild_required {
        println!("  {}", style("Rebuild required: run `claimlens repair`").red());
    }

    println!();
    println!("{}", style("Inference gateway").bold());
    let health = tokio::task::spawn_blocking(move || client.health_check())
        .await
        .context("Health check task failed")?;
    match health {
        Ok(()) => println!("  {}", style("reachable, models available").green()),
        Err(error) => println!("  {}", style(format!("unavailable: {}", error)).red()),
    }

    let snapshot = telemetry.snapshot();
    println!();
    println!("{}", style("Session telemetry").bold());
    println!("  Inference attempts: {}", snapshot.inference_attempts);
    println!("  Cache hits/misses: {}/{}", snapshot.cache_hits, snapshot.cache_misses);
    println!("  Searches: {}", snapshot.searches);
    println!("  Fallback scans: {}", snapshot.fallback_scans);

    Ok(())
}

/// Validate the dual-store invariant and repair divergence.
#[inline]
pub async fn repair() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    let (coordinator, _client, _telemetry) = build_stack(&config).await?;

    let validator = ConsistencyValidator::new(&coordinator);
    let before = validator.validate().await?;

    println!("Metadata chunks: {}", before.metadata_chunks);
    println!("Index rows: {}", before.index_rows);
    println!("Missing from index: {}", before.missing_in_index.len());
    println!("Awaiting promotion: {}", before.awaiting_promotion.len());
    println!("Orphaned in index: {}", before.orphaned_in_index.len());
    println!("Dimension drift: {}", before.dimension_drift.len());

    if before.is_consistent && !before.rebuild_required {
        println!("{}", style("Stores are consistent.").green());
        return Ok(());
    }

    let report = validator.repair().await?;
    println!(
        "Repair complete: {} re-inserted, {} promoted, {} orphans removed, {} chunks still need re-embedding",
        report.reinserted, report.promoted, report.orphans_removed, report.drift_remaining
    );
    if report.drift_remaining > 0 {
        println!(
            "{}",
            style("Re-ingest the affected documents to regenerate embeddings.").yellow()
        );
    }

    Ok(())
}
