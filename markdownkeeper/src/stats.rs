//! `stats` and `report`: index health summaries printed to stdout.
//!
//! `stats` is the quick at-a-glance summary; `report` is the deeper dive
//! (embedding coverage fractions, event queue detail, stale backends).

use markdownkeeper_core::error::CoreResult;
use markdownkeeper_core::store::Store;
use serde::Serialize;

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[derive(Serialize)]
pub struct StatsSummary {
    pub database_path: String,
    pub database_bytes: u64,
    pub documents: u64,
    pub headings: u64,
    pub links: u64,
    pub broken_links: u64,
    pub chunks: u64,
    pub embeddings: u64,
}

pub async fn collect_stats(store: &dyn Store) -> CoreResult<StatsSummary> {
    let health = store.health_report().await?;
    Ok(StatsSummary {
        database_path: health.database_path,
        database_bytes: health.database_bytes,
        documents: health.stats.documents,
        headings: health.stats.headings,
        links: health.stats.links,
        broken_links: health.stats.broken_links,
        chunks: health.stats.chunks,
        embeddings: health.stats.embeddings,
    })
}

pub fn print_stats_text(summary: &StatsSummary) {
    println!("MarkdownKeeper — index stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", summary.database_path);
    println!("  Size:        {}", format_bytes(summary.database_bytes));
    println!();
    println!("  Documents:   {}", summary.documents);
    println!("  Headings:    {}", summary.headings);
    println!("  Links:       {} ({} broken)", summary.links, summary.broken_links);
    println!("  Chunks:      {}", summary.chunks);
    println!("  Embeddings:  {}", summary.embeddings);
    println!();
}

#[derive(Serialize)]
pub struct ReportSummary {
    pub stats: StatsSummary,
    pub document_embedding_fraction: f64,
    pub chunk_embedding_fraction: f64,
    pub queued: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
    pub stale_embedding_backends: Vec<String>,
}

pub async fn collect_report(store: &dyn Store) -> CoreResult<ReportSummary> {
    let health = store.health_report().await?;
    let coverage = store.embedding_coverage().await?;
    let queue = store.event_queue_status().await?;

    Ok(ReportSummary {
        stats: StatsSummary {
            database_path: health.database_path,
            database_bytes: health.database_bytes,
            documents: health.stats.documents,
            headings: health.stats.headings,
            links: health.stats.links,
            broken_links: health.stats.broken_links,
            chunks: health.stats.chunks,
            embeddings: health.stats.embeddings,
        },
        document_embedding_fraction: coverage.document_fraction(),
        chunk_embedding_fraction: coverage.chunk_fraction(),
        queued: queue.queued,
        in_flight: queue.in_flight,
        done: queue.done,
        failed: queue.failed,
        stale_embedding_backends: health.stale_embedding_backends,
    })
}

pub fn print_report_text(report: &ReportSummary) {
    print_stats_text(&report.stats);
    println!("  Embedding coverage:");
    println!("    documents:  {:.1}%", report.document_embedding_fraction * 100.0);
    println!("    chunks:     {:.1}%", report.chunk_embedding_fraction * 100.0);
    println!();
    println!("  Event queue:");
    println!("    queued:     {}", report.queued);
    println!("    in_flight:  {}", report.in_flight);
    println!("    done:       {}", report.done);
    println!("    failed:     {}", report.failed);
    println!();
    if !report.stale_embedding_backends.is_empty() {
        println!("  Stale embedding backends (regeneration required):");
        for backend in &report.stale_embedding_backends {
            println!("    - {backend}");
        }
        println!();
    }
}
