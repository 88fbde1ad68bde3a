use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use forumdb::analyze::{Analyzer, RunSummary};
use forumdb::config::Settings;
use forumdb::merge::{self, MergeReport};

#[derive(Parser)]
#[command(name = "forumdb", about = "Merge per-forum SQLite databases and analyze their posts")]
struct Cli {
    /// Settings file (TOML); FORUMDB_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge per-forum databases into one unified database
    Merge {
        /// Unified database to write
        #[arg(long)]
        target: Option<PathBuf>,
        /// Source databases (default: every match of --pattern in --source-dir)
        #[arg(long, num_args = 1..)]
        sources: Vec<PathBuf>,
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(long)]
        pattern: Option<String>,
        /// Keep source ids as they are (colliding rows are dropped)
        #[arg(long)]
        no_offset: bool,
        /// Only print the structure of the sources
        #[arg(long)]
        dry_run: bool,
        /// Append into an existing target instead of re-creating it
        #[arg(long)]
        keep_target: bool,
        /// Database receiving sidecar analysis rows (default: the analysis database)
        #[arg(long)]
        analysis_target: Option<PathBuf>,
        /// Rows per insert batch
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Count tokens, words and characters of posts not analyzed yet
    Analyze {
        #[arg(long)]
        source_db: Option<PathBuf>,
        #[arg(long)]
        analysis_db: Option<PathBuf>,
        /// Comma-separated forum names (default: every forum in the database)
        #[arg(long, value_delimiter = ',')]
        forums: Option<Vec<String>>,
        /// Analyze one batch of N posts
        #[arg(long, conflicts_with_all = ["all", "continuous"])]
        batch: Option<usize>,
        /// Analyze every pending post
        #[arg(long, conflicts_with = "continuous")]
        all: bool,
        /// Keep polling for new posts until Ctrl+C
        #[arg(long)]
        continuous: bool,
        /// Seconds between polls in continuous mode
        #[arg(long)]
        interval: Option<u64>,
        /// Posts per batch for --all and --continuous
        #[arg(long)]
        batch_size: Option<usize>,
        /// Per-forum progress
        #[arg(long)]
        info: bool,
        /// Totals and recent daily statistics
        #[arg(long)]
        summary: bool,
        /// Print --info / --summary as JSON
        #[arg(long)]
        json: bool,
        /// Analyze on the calling thread only
        #[arg(long)]
        no_multiprocessing: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Batches larger than this go to the worker pool
        #[arg(long)]
        threshold: Option<usize>,
        #[arg(long)]
        no_progress: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Merge {
            target,
            sources,
            source_dir,
            pattern,
            no_offset,
            dry_run,
            keep_target,
            analysis_target,
            batch_size,
        } => {
            if let Some(t) = target {
                settings.target_db = t;
            }
            if let Some(d) = source_dir {
                settings.source_dir = d;
            }
            if let Some(p) = pattern {
                settings.source_pattern = p;
            }
            if let Some(n) = batch_size {
                settings.merge_batch_size = n;
            }
            settings.validate()?;

            let sources = if sources.is_empty() {
                merge::find_sources(
                    &settings.source_dir,
                    &settings.source_pattern,
                    Some(&settings.target_db),
                )
                .with_context(|| format!("Failed to list {}", settings.source_dir.display()))?
            } else {
                sources
            };
            if sources.is_empty() {
                bail!(
                    "No databases matching {} in {}",
                    settings.source_pattern,
                    settings.source_dir.display()
                );
            }

            if dry_run {
                print_structure(&merge::dry_run(&sources)?);
                Ok(())
            } else {
                println!("Merging {} databases into {}", sources.len(), settings.target_db.display());
                let mut options = settings.merge_options();
                options.use_offsets = !no_offset;
                options.recreate = !keep_target;
                if analysis_target.is_some() {
                    options.analysis_target = analysis_target;
                }
                let merger = merge::Merger::open(options)?;
                let report = merger.merge(&sources)?;
                print_merge_report(&report);
                print_final_statistics(&merge::final_statistics(merger.target())?);
                if !report.is_success() {
                    bail!("{} of {} sources failed to merge", report.failures.len(), sources.len());
                }
                Ok(())
            }
        }
        Commands::Analyze {
            source_db,
            analysis_db,
            forums,
            batch,
            all,
            continuous,
            interval,
            batch_size,
            info,
            summary,
            json,
            no_multiprocessing,
            workers,
            chunk_size,
            threshold,
            no_progress,
        } => {
            if let Some(p) = source_db {
                settings.source_db = p;
            }
            if let Some(p) = analysis_db {
                settings.analysis_db = p;
            }
            if let Some(f) = forums {
                settings.forums = f.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
            if let Some(n) = interval {
                settings.interval_secs = n;
            }
            if let Some(n) = batch_size {
                settings.batch_size = n;
            }
            if no_multiprocessing {
                settings.use_workers = false;
            }
            if let Some(n) = workers {
                settings.workers = n;
            }
            if let Some(n) = chunk_size {
                settings.chunk_size = n;
            }
            if let Some(n) = threshold {
                settings.parallel_threshold = n;
            }
            if no_progress {
                settings.show_progress = false;
            }
            settings.validate()?;

            let analyzer = Analyzer::new(settings.analyzer_config())?;

            if info {
                let forums = analyzer.forums_info()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&forums)?);
                } else {
                    println!("{:<24} | {:>10} | {:>10} | {:>7}", "Forum", "Posts", "Analyzed", "Done");
                    println!("{}", "-".repeat(60));
                    for f in &forums {
                        println!(
                            "{:<24} | {:>10} | {:>10} | {:>6.1}%",
                            truncate(&f.forum, 24),
                            f.total_posts,
                            f.analyzed_posts,
                            f.progress_percent
                        );
                    }
                }
            } else if summary {
                let s = analyzer.summary()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&s)?);
                } else {
                    println!("Method:    {} ({} tokenizer)", s.method, s.tokenizer);
                    println!("Posts:     {}", s.total_posts);
                    println!("Analyzed:  {} ({:.1}%)", s.total_analyzed, s.progress_percent);
                    println!("Tokens:    {}", s.total_tokens);
                    println!("Words:     {}", s.total_words);
                    if !s.recent_days.is_empty() {
                        println!("\n--- Last {} days ---", s.recent_days.len());
                        for d in &s.recent_days {
                            println!(
                                "  {}: {} posts, {} tokens, {} words, {:.1}s",
                                d.date, d.posts_analyzed, d.total_tokens, d.total_words, d.processing_time_seconds
                            );
                        }
                    }
                }
            } else if all {
                let run = analyzer.run_all(settings.batch_size)?;
                print_run_summary(&run);
            } else if continuous {
                let (stop_tx, stop_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Ctrl+C received, stopping after the current batch");
                        let _ = stop_tx.send(true);
                    }
                });
                let done = analyzer
                    .run_continuous(
                        Duration::from_secs(settings.interval_secs),
                        settings.batch_size,
                        stop_rx,
                    )
                    .await;
                println!(
                    "Stopped: {} iterations, {} posts persisted, {} failed iterations",
                    done.iterations, done.total_persisted, done.failed_iterations
                );
            } else {
                let n = batch.unwrap_or(settings.batch_size);
                let persisted = analyzer.run_batch(n)?;
                let s = analyzer.stats().snapshot();
                println!(
                    "Analyzed {} posts ({} errors, {} heuristic, {} fallbacks)",
                    persisted, s.processing_errors, s.heuristic_tokens, s.tokenizer_fallbacks
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn print_structure(sources: &[merge::SourceStructure]) {
    for s in sources {
        println!("{} ({})", s.name, s.path.display());
        for t in &s.tables {
            let max_id = t.max_id.map(|m| m.to_string()).unwrap_or_else(|| "-".into());
            println!(
                "  {:<24} {:>10} rows  max id {:>8}  [{}]",
                t.name,
                t.row_count,
                max_id,
                t.column_names().join(", ")
            );
        }
    }
}

fn print_merge_report(report: &MergeReport) {
    for s in &report.sources {
        println!("\n{} ({}): {} rows", s.name, s.path.display(), s.rows_inserted());
        for t in &s.tables {
            let skipped = t.read - t.inserted;
            if skipped > 0 {
                println!("  {:<24} {:>10} / {:<10} (+{}, {} skipped)", t.table, t.inserted, t.read, t.offset, skipped);
            } else {
                println!("  {:<24} {:>10} / {:<10} (+{})", t.table, t.inserted, t.read, t.offset);
            }
        }
        if let Some(side) = &s.sidecar {
            let rows: usize = side.tables.iter().map(|t| t.inserted).sum();
            println!("  sidecar {}: {} rows", side.path.display(), rows);
        }
        if let Some(err) = &s.sidecar_error {
            println!("  sidecar failed: {}", err);
        }
    }

    for o in report.integrity.iter().filter(|o| o.orphans > 0) {
        println!(
            "WARNING: {} rows of {}.{} point to a missing {} row",
            o.orphans, o.edge.child_table, o.edge.child_column, o.edge.parent_table
        );
    }

    if !report.failures.is_empty() {
        println!("\n--- Failed sources ---");
        for f in &report.failures {
            match &f.table {
                Some(t) => println!("  {} (table {}): {}", f.path.display(), t, f.error),
                None => println!("  {}: {}", f.path.display(), f.error),
            }
        }
    }
}

fn print_final_statistics(stats: &merge::FinalStatistics) {
    println!("\n--- Tables ---");
    for (table, n) in &stats.table_counts {
        println!("  {:<24} {:>10}", table, n);
    }
    if !stats.forums.is_empty() {
        println!("\n--- Forums ---");
        for f in &stats.forums {
            println!(
                "  {:>4} {:<24} {:>6} sections {:>10} posts",
                f.id,
                truncate(f.spider_name.as_deref().unwrap_or("-"), 24),
                f.sections,
                f.posts
            );
        }
    }
    if !stats.users_by_source.is_empty() {
        println!("\n--- Users ---");
        for (source, n) in &stats.users_by_source {
            println!("  {:<24} {:>10}", source.as_deref().unwrap_or("-"), n);
        }
    }
    if stats.duplicate_usernames.is_empty() {
        println!("\nNo duplicate usernames");
    } else {
        println!("\nDuplicate usernames:");
        for (name, n) in &stats.duplicate_usernames {
            println!("  {}: {}", name, n);
        }
    }
}

fn print_run_summary(run: &RunSummary) {
    println!(
        "Analyzed {}/{} posts in {} batches ({} errors) from forums: {}",
        run.total_analyzed,
        run.total_eligible,
        run.batches,
        run.errors,
        run.forums.join(", ")
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
