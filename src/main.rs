use anyhow::{Context, Result};
use clap::Parser;
use culprit::cache::{ResolutionCache, CACHE_FILE};
use culprit::config::Config;
use culprit::git_ops::CommitDiffResolver;
use culprit::pipeline;
use culprit::record::FailureRecord;
use culprit::traceback::TracebackExtractor;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "culprit",
    about = "Correlates CI test failures with the commits that likely caused them",
    version
)]
struct Args {
    /// JSON Lines file of CI failure records
    records: PathBuf,

    /// Path to the local clone of the repository under test
    #[arg(short, long)]
    repo: Option<PathBuf>,

    /// Branch to compute merge-bases against
    #[arg(short, long)]
    anchor: Option<String>,

    /// Directory holding the resolution cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load();

    let repo = args
        .repo
        .or_else(|| config.repo_path.clone())
        .context("No repository given; pass --repo or set repo_path in the config")?;
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Repository not found: {}", repo.display()))?;
    let anchor = args
        .anchor
        .unwrap_or_else(|| config.anchor_branch.clone());

    let resolver = CommitDiffResolver::open(&repo)?;
    let branch = resolver
        .current_branch()
        .unwrap_or_else(|_| "detached".to_string());
    eprintln!("  Correlating against {} @ {}", repo.display(), branch);

    let records = load_records(&args.records)?;
    eprintln!("  {} records loaded", records.len());

    let cache_path = args
        .cache_dir
        .map(|dir| dir.join(CACHE_FILE))
        .unwrap_or_else(|| config.cache_path());
    let mut cache = ResolutionCache::load(&cache_path);

    let extractor = TracebackExtractor::new(&config);
    let outcomes = pipeline::correlate(&records, &extractor, &resolver, &mut cache, &anchor);

    cache
        .flush()
        .with_context(|| format!("Failed to save the resolution cache to {}", cache_path.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut matched = 0usize;
    for outcome in &outcomes {
        if outcome.matched.is_some() {
            matched += 1;
        }
        serde_json::to_writer(&mut out, outcome)?;
        writeln!(out)?;
    }
    eprintln!(
        "  {} of {} failures implicate a file their commit modified",
        matched,
        outcomes.len()
    );

    Ok(())
}

/// Read failure records from a JSON Lines file. Rows that don't parse
/// are skipped with a warning; a bad row should never sink a run.
fn load_records(path: &Path) -> Result<Vec<FailureRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open records file {}", path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FailureRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                eprintln!("  Warning: skipping record on line {}: {}", lineno + 1, err)
            }
        }
    }
    Ok(records)
}
