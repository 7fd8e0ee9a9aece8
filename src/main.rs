use clap::{Parser, Subcommand};
use colored::Colorize;
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// subref - Find unlinked subheading mentions across plain-text notes
#[derive(Parser)]
#[command(name = "subref")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".subref.toml")]
    config: PathBuf,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a note for unlinked mentions of other notes' subheadings
    Scan {
        /// The active note
        file: PathBuf,

        /// Vault root to search for candidate notes
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// File extensions to consider (comma-separated)
        #[arg(short, long, default_value = "md,txt")]
        types: String,

        /// Heading levels to include, comma-separated (overrides config)
        #[arg(short, long)]
        levels: Option<String>,

        /// Minimum heading text length (overrides config)
        #[arg(short, long)]
        min_heading_len: Option<i64>,

        /// Folder prefixes to exclude (can be repeated, overrides config)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the headings the extractor sees in one note
    Headings {
        /// Note to inspect
        file: PathBuf,

        /// Heading levels to include, comma-separated (overrides config)
        #[arg(short, long)]
        levels: Option<String>,

        /// Minimum heading text length (overrides config)
        #[arg(short, long)]
        min_heading_len: Option<i64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the candidate phrases extracted from one note
    Phrases {
        /// Note to inspect
        file: PathBuf,

        /// Maximum phrases to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show vault-wide heading statistics
    Stats {
        /// Vault root
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// File extensions to consider (comma-separated)
        #[arg(short, long, default_value = "md,txt")]
        types: String,

        /// Folder prefixes to exclude (can be repeated, overrides config)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// Settings file (.subref.toml). Every field has a default so a partial
// or missing file is fine.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
struct Config {
    include_heading_levels: Vec<i64>,
    min_heading_text_length: i64,
    exclude_folders: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            include_heading_levels: vec![1, 2, 3],
            min_heading_text_length: 3,
            exclude_folders: Vec::new(),
        }
    }
}

/// Normalized settings consumed by the extraction and matching functions.
/// Out-of-range config values are dropped or clamped here rather than
/// reported; bad settings degrade to fewer matches, never to a hard failure.
#[derive(Debug, Clone)]
struct ScanSettings {
    levels: HashSet<usize>,
    min_heading_len: usize,
    exclude_folders: Vec<String>,
}

impl ScanSettings {
    fn from_config(config: &Config) -> Self {
        let levels: HashSet<usize> = config
            .include_heading_levels
            .iter()
            .filter(|&&l| (1..=6).contains(&l))
            .map(|&l| l as usize)
            .collect();

        let min_heading_len = config.min_heading_text_length.max(1) as usize;

        let exclude_folders: Vec<String> = config
            .exclude_folders
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        ScanSettings {
            levels,
            min_heading_len,
            exclude_folders,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Heading {
    line: usize,
    level: usize,
    text: String,
}

#[derive(Serialize, Debug)]
struct Mention {
    source_path: String,
    heading: Heading,
    matched_phrase: String,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Scan { file, path, types, levels, min_heading_len, exclude, json } => {
            let config = apply_overrides(config, levels.as_deref(), min_heading_len, &exclude);
            let settings = ScanSettings::from_config(&config);
            cmd_scan(&file, &path, &types, json, &settings, cli.quiet)
        }
        Commands::Headings { file, levels, min_heading_len, json } => {
            let config = apply_overrides(config, levels.as_deref(), min_heading_len, &[]);
            let settings = ScanSettings::from_config(&config);
            cmd_headings(&file, json, &settings)
        }
        Commands::Phrases { file, limit, json } => {
            cmd_phrases(&file, limit, json)
        }
        Commands::Stats { path, types, exclude, json } => {
            let config = apply_overrides(config, None, None, &exclude);
            let settings = ScanSettings::from_config(&config);
            cmd_stats(&path, &types, json, &settings, cli.quiet)
        }
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(_) => Ok(Config::default()),
    }
}

/// Fold command-line flags over the file config. Flags win when present.
fn apply_overrides(
    mut config: Config,
    levels: Option<&str>,
    min_heading_len: Option<i64>,
    exclude: &[String],
) -> Config {
    if let Some(list) = levels {
        config.include_heading_levels = list
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
    }
    if let Some(min) = min_heading_len {
        config.min_heading_text_length = min;
    }
    if !exclude.is_empty() {
        config.exclude_folders = exclude.to_vec();
    }
    config
}

// ============================================================================
// Core: heading extraction, phrase extraction, mention matching
// ============================================================================

/// Extract headings from markdown-style text, in document order.
/// Line numbers are 0-based. Lines inside code fences are not special-cased;
/// a literal `#`-prefixed line is always a candidate.
fn extract_headings(text: &str, settings: &ScanSettings) -> Vec<Heading> {
    let heading_re = Regex::new(r"^(#{1,6})\s+(.+)$").unwrap();
    let mut headings = Vec::new();

    for (line, raw) in text.lines().enumerate() {
        if let Some(caps) = heading_re.captures(raw) {
            let level = caps.get(1).map(|m| m.as_str().len()).unwrap_or(1);
            let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

            if settings.levels.contains(&level) && text.len() >= settings.min_heading_len {
                headings.push(Heading {
                    line,
                    level,
                    text: text.to_string(),
                });
            }
        }
    }

    headings
}

/// Extract candidate phrases from prose: significant single words (5+ chars),
/// bigrams, and trigrams, after stripping code fences and front matter.
/// Deduplicated and sorted longest-first (ties lexical) so the most specific
/// phrase is tried first during a scan.
fn extract_phrases(text: &str) -> Vec<String> {
    let fence_re = Regex::new(r"(?s)```.*?```").unwrap();
    let front_matter_re = Regex::new(r"(?s)---.*?---").unwrap();
    let sentence_re = Regex::new(r"[.!?]+").unwrap();

    let cleaned = fence_re.replace_all(text, "");
    let cleaned = front_matter_re.replace_all(&cleaned, "");

    let mut seen: HashSet<String> = HashSet::new();

    for sentence in sentence_re.split(&cleaned) {
        let words: Vec<&str> = sentence
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .collect();

        // A one-word sentence carries no phrase context
        if words.len() <= 1 {
            continue;
        }

        for word in &words {
            if word.len() >= 5 {
                seen.insert((*word).to_string());
            }
        }

        for pair in words.windows(2) {
            seen.insert(format!("{} {}", pair[0], pair[1]));
        }

        for triple in words.windows(3) {
            seen.insert(format!("{} {} {}", triple[0], triple[1], triple[2]));
        }
    }

    let mut phrases: Vec<String> = seen.into_iter().collect();
    phrases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    phrases
}

/// Case-insensitive fuzzy containment: the phrase must be 3+ characters,
/// cover at least 40% of the heading's length, and appear as a contiguous
/// substring of the heading. No word-boundary enforcement.
fn is_significant_mention(phrase: &str, heading_text: &str) -> bool {
    let phrase = phrase.to_lowercase();
    let heading = heading_text.to_lowercase();

    phrase.len() >= 3
        && phrase.len() as f64 >= heading.len() as f64 * 0.4
        && heading.contains(&phrase)
}

/// Scan the active note against a set of candidate documents. Phrases are
/// extracted once; for each heading the first matching phrase (in sorted
/// order) wins and no further phrases are tried for that heading, so at
/// most one mention is emitted per (document, heading) pair.
fn scan_mentions(
    active_text: &str,
    docs: &[(String, String)],
    settings: &ScanSettings,
) -> Vec<Mention> {
    let phrases = extract_phrases(active_text);
    let mut mentions = Vec::new();

    for (path, text) in docs {
        for heading in extract_headings(text, settings) {
            let matched = phrases
                .iter()
                .find(|p| is_significant_mention(p.as_str(), &heading.text));

            if let Some(phrase) = matched {
                mentions.push(Mention {
                    source_path: path.clone(),
                    matched_phrase: phrase.clone(),
                    heading,
                });
            }
        }
    }

    mentions
}

/// Group mentions by source document, preserving first-seen order.
fn group_mentions(mentions: Vec<Mention>) -> Vec<(String, Vec<Mention>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Mention>> = HashMap::new();

    for mention in mentions {
        if !groups.contains_key(&mention.source_path) {
            order.push(mention.source_path.clone());
        }
        groups
            .entry(mention.source_path.clone())
            .or_insert_with(Vec::new)
            .push(mention);
    }

    order
        .into_iter()
        .map(|path| {
            let group = groups.remove(&path).unwrap_or_default();
            (path, group)
        })
        .collect()
}

fn is_excluded(rel_path: &str, exclude_folders: &[String]) -> bool {
    exclude_folders
        .iter()
        .any(|folder| rel_path.starts_with(folder.as_str()))
}

/// Note title for display: filename without the .md extension.
fn note_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.trim_end_matches(".md").to_string()
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_scan(
    file: &Path,
    vault: &Path,
    types: &str,
    json: bool,
    settings: &ScanSettings,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let active_text = fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let active_abs = fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());

    if !quiet && !json {
        println!("{} {}", "Scanning".cyan().bold(), file.display());
    }

    let extensions: HashSet<String> = types.split(',').map(|s| s.trim().to_lowercase()).collect();

    let mut builder = WalkBuilder::new(vault);
    builder.hidden(true).git_ignore(true).git_global(true);

    let mut docs: Vec<(String, String)> = Vec::new();
    let mut skipped = 0;

    for entry in builder.build().filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if !extensions.contains(&ext) {
            continue;
        }

        // Never scan the active note against itself
        let abs = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if abs == active_abs {
            continue;
        }

        let rel = path
            .strip_prefix(vault)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        if is_excluded(&rel, &settings.exclude_folders) {
            continue;
        }

        match fs::read_to_string(path) {
            Ok(text) => docs.push((rel, text)),
            Err(e) => {
                skipped += 1;
                if !quiet {
                    eprintln!("{}: skipping {}: {}", "warning".yellow().bold(), rel, e);
                }
            }
        }
    }

    // Deterministic candidate order regardless of walk order
    docs.sort_by(|a, b| a.0.cmp(&b.0));

    let mentions = scan_mentions(&active_text, &docs, settings);
    let grouped = group_mentions(mentions);
    let elapsed = start.elapsed();

    if json {
        let output: Vec<_> = grouped
            .iter()
            .map(|(path, mentions)| {
                serde_json::json!({
                    "file": path,
                    "mentions": mentions,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let summary = format!(
        "Searched {} notes in {:.2?}{}",
        docs.len(),
        elapsed,
        if skipped > 0 {
            format!(" ({} unreadable, skipped)", skipped)
        } else {
            String::new()
        }
    );

    if grouped.is_empty() {
        println!("{}", "No subheading mentions found.".yellow());
        if !quiet {
            println!("{}", summary.dimmed());
        }
        return Ok(());
    }

    let total: usize = grouped.iter().map(|(_, m)| m.len()).sum();
    println!(
        "{} unlinked subheading mentions in {} notes\n",
        total.to_string().green().bold(),
        grouped.len().to_string().cyan()
    );

    for (path, mentions) in &grouped {
        println!("{} {}", note_name(path).cyan().bold(), path.dimmed());
        for m in mentions {
            println!(
                "  {} {} {}",
                "#".repeat(m.heading.level).dimmed(),
                m.heading.text,
                format!("(L{}, matched \"{}\")", m.heading.line + 1, m.matched_phrase).dimmed()
            );
        }
        println!();
    }

    if !quiet {
        println!("{}", summary.dimmed());
    }

    Ok(())
}

fn cmd_headings(
    file: &Path,
    json: bool,
    settings: &ScanSettings,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;

    let headings = extract_headings(&text, settings);

    if json {
        println!("{}", serde_json::to_string_pretty(&headings)?);
        return Ok(());
    }

    if headings.is_empty() {
        println!("{}", "No headings matched the current settings.".yellow());
        return Ok(());
    }

    for h in &headings {
        println!(
            "{:>5}  {} {}",
            (h.line + 1).to_string().dimmed(),
            "#".repeat(h.level).dimmed(),
            h.text
        );
    }

    Ok(())
}

fn cmd_phrases(
    file: &Path,
    limit: usize,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;

    let phrases = extract_phrases(&text);

    if json {
        println!("{}", serde_json::to_string_pretty(&phrases)?);
        return Ok(());
    }

    if phrases.is_empty() {
        println!("{}", "No candidate phrases found.".yellow());
        return Ok(());
    }

    println!(
        "{} candidate phrases (longest first)\n",
        phrases.len().to_string().green().bold()
    );

    for phrase in phrases.iter().take(limit) {
        println!("  {}", phrase);
    }

    if phrases.len() > limit {
        println!("\n{}", format!("... and {} more", phrases.len() - limit).dimmed());
    }

    Ok(())
}

fn cmd_stats(
    vault: &Path,
    types: &str,
    json: bool,
    settings: &ScanSettings,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let extensions: HashSet<String> = types.split(',').map(|s| s.trim().to_lowercase()).collect();

    let mut builder = WalkBuilder::new(vault);
    builder.hidden(true).git_ignore(true).git_global(true);

    let mut file_count = 0;
    let mut total_headings = 0;
    let mut files_without_headings = 0;
    let mut unreadable = 0;
    let mut level_counts = [0usize; 7];

    for entry in builder.build().filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if !extensions.contains(&ext) {
            continue;
        }

        let rel = path
            .strip_prefix(vault)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        if is_excluded(&rel, &settings.exclude_folders) {
            continue;
        }

        match fs::read_to_string(path) {
            Ok(text) => {
                let headings = extract_headings(&text, settings);
                if headings.is_empty() {
                    files_without_headings += 1;
                }
                total_headings += headings.len();
                for h in &headings {
                    level_counts[h.level] += 1;
                }
                file_count += 1;
            }
            Err(e) => {
                unreadable += 1;
                if !quiet {
                    eprintln!("{}: skipping {}: {}", "warning".yellow().bold(), rel, e);
                }
            }
        }
    }

    if json {
        let by_level: HashMap<String, usize> = (1..=6)
            .map(|l: usize| (l.to_string(), level_counts[l]))
            .collect();
        let output = serde_json::json!({
            "files": file_count,
            "headings": total_headings,
            "files_without_headings": files_without_headings,
            "unreadable": unreadable,
            "by_level": by_level,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "Vault Statistics".green().bold());
    println!();
    println!("  Notes:                {}", file_count.to_string().cyan());
    println!("  Headings:             {}", total_headings.to_string().cyan());
    println!("  Notes w/o headings:   {}", files_without_headings.to_string().cyan());
    if unreadable > 0 {
        println!("  Unreadable (skipped): {}", unreadable.to_string().yellow());
    }
    println!();
    println!("{}", "Headings by Level".green().bold());
    println!();

    for level in 1..=6 {
        let count = level_counts[level];
        let bar = "=".repeat((count / 2).min(40));
        println!(
            "  {:>6} {:>5} {}",
            "#".repeat(level).cyan(),
            count,
            bar.dimmed()
        );
    }

    Ok(())
}
