use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use branchweave_core::audit::{read_entries, verify_chain};
use branchweave_core::checkpoint::{inspect, CheckpointStatus};
use branchweave_core::config::CONFIG_FILE_NAME;
use branchweave_core::{CandidateBranch, CoreConfig, DecisionContext, Director, Sanitizer, ValidationContext};
use branchweave_rules::{evaluate_input_against_rules, load_rulebook_from_file};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "branchweave-admin",
    about = "Admin helpers for a branchweave story root"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write a default config and seed the embedded rulebook
    Init {
        #[arg(long, default_value = ".")]
        root: String,
        /// Overwrite an existing branchweave.toml
        #[arg(long)]
        force: bool,
    },
    /// Dry-run the validation pipeline and decision engine on a candidate file
    Validate {
        #[arg(long, default_value = ".")]
        root: String,
        /// JSON file: `{ "candidate": {..}, "context": {..} }`
        #[arg(long)]
        input: String,
        #[arg(long, default_value_t = 1.0)]
        pacing_fit: f64,
        #[arg(long, default_value_t = 1.0)]
        return_confidence: f64,
        /// Fail on any coherence finding instead of downgrading the recommendation
        #[arg(long)]
        strict: bool,
    },
    /// Scan a plain-text file against the rulebook's lexicon rules
    Lexicon {
        #[arg(long, default_value = ".")]
        root: String,
        #[arg(long)]
        input: String,
        /// Rulebook to use instead of the one configured under the root
        #[arg(long)]
        rulebook: Option<String>,
    },
    /// Check every checkpoint file's schema and checksum
    VerifyCheckpoints {
        #[arg(long, default_value = ".")]
        root: String,
    },
    /// Confirm a session's transitions form one unbroken chain in the audit log
    AuditChain {
        #[arg(long, default_value = ".")]
        root: String,
        #[arg(long)]
        session: String,
    },
}

#[derive(Deserialize)]
struct ValidationInput {
    candidate: CandidateBranch,
    #[serde(default)]
    context: ValidationContext,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("install log subscriber")?;

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init { root, force } => init(Path::new(&root), force),
        Cmd::Validate {
            root,
            input,
            pacing_fit,
            return_confidence,
            strict,
        } => validate(Path::new(&root), Path::new(&input), pacing_fit, return_confidence, strict),
        Cmd::Lexicon { root, input, rulebook } => {
            lexicon(Path::new(&root), Path::new(&input), rulebook.as_deref().map(Path::new))
        }
        Cmd::VerifyCheckpoints { root } => verify_checkpoints(Path::new(&root)),
        Cmd::AuditChain { root, session } => audit_chain(Path::new(&root), &session),
    }
}

fn init(root: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(root).with_context(|| format!("mkdir -p {root:?}"))?;
    let cfg_path = root.join(CONFIG_FILE_NAME);
    anyhow::ensure!(
        force || !cfg_path.exists(),
        "{} already exists (use --force to overwrite)",
        cfg_path.display()
    );

    let cfg = CoreConfig::rooted(root);
    // Relative paths stay relative in the written file so the root can move.
    let text = CoreConfig::default().to_toml_string()?;
    fs::write(&cfg_path, text).with_context(|| format!("write {cfg_path:?}"))?;

    let seeded = branchweave_rules::assets::write_default_rulebooks(&cfg.rules.path)?;
    fs::create_dir_all(&cfg.checkpoints.path)
        .with_context(|| format!("mkdir -p {:?}", cfg.checkpoints.path))?;

    tracing::info!(root = %root.display(), seeded = seeded.len(), "story root initialized");
    println!(
        "initialized {} at {} (rulebooks seeded: {})",
        cfg_path.display(),
        Utc::now().to_rfc3339(),
        if seeded.is_empty() { "none".to_string() } else { seeded.join(", ") }
    );
    Ok(())
}

fn validate(root: &Path, input: &Path, pacing_fit: f64, return_confidence: f64, strict: bool) -> Result<()> {
    let cfg = CoreConfig::load(root)?;
    let text = fs::read_to_string(input).with_context(|| format!("read {input:?}"))?;
    let ValidationInput { candidate, context } =
        serde_json::from_str(&text).with_context(|| format!("parse {input:?}"))?;

    let sanitizer = Sanitizer::from_config(&cfg)?;
    let report = if strict {
        sanitizer.validate_strict(&candidate, &context)?
    } else {
        sanitizer.validate(&candidate, &context)
    };
    let content = report
        .revision
        .as_ref()
        .map(|r| r.content.as_str())
        .unwrap_or(candidate.content.as_str());
    let ctx = DecisionContext {
        pacing_fit,
        return_path_confidence: return_confidence,
        reference_text: None,
    };
    let verdict = Director::new(cfg.decision.clone()).decide(&report, &ctx, content);

    let out = serde_json::json!({ "report": report, "verdict": verdict });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn lexicon(root: &Path, input: &Path, rulebook: Option<&Path>) -> Result<()> {
    let book = match rulebook {
        Some(path) => load_rulebook_from_file(path)?,
        None => Sanitizer::from_config(&CoreConfig::load(root)?)?.rulebook().clone(),
    };
    let text = fs::read_to_string(input).with_context(|| format!("read {input:?}"))?;
    let result = evaluate_input_against_rules(&text, &book);
    println!("{}", serde_json::to_string_pretty(&result)?);
    anyhow::ensure!(result.passed, "{} ({} {})", result.reason, book.name, book.version);
    Ok(())
}

fn verify_checkpoints(root: &Path) -> Result<()> {
    let cfg = CoreConfig::load(root)?;
    let dir: PathBuf = cfg.checkpoints.path.clone();
    anyhow::ensure!(dir.exists(), "checkpoint directory missing at {}", dir.display());

    let mut checked = 0usize;
    let mut bad = 0usize;
    for entry in WalkDir::new(&dir).min_depth(2).max_depth(2) {
        let entry = entry.with_context(|| format!("walk {dir:?}"))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let info = inspect(path, cfg.checkpoints.schema_version);
        checked += 1;
        if info.status != CheckpointStatus::Ok {
            bad += 1;
        }
        println!("{}", serde_json::to_string(&info)?);
    }
    anyhow::ensure!(bad == 0, "{bad} of {checked} checkpoints failed verification");
    println!("{checked} checkpoints ok");
    Ok(())
}

fn audit_chain(root: &Path, session: &str) -> Result<()> {
    let cfg = CoreConfig::load(root)?;
    let entries = read_entries(&cfg.audit.log_path)?;
    let report = verify_chain(&entries, session);
    println!("{}", serde_json::to_string_pretty(&report)?);
    anyhow::ensure!(
        report.is_complete(),
        "session {session} chain incomplete: {}",
        report.problems.join("; ")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchweave_rules::assets::DEFAULT_RULEBOOK_TOML;

    #[test]
    fn lexicon_fails_only_when_a_rule_fires() {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = dir.path().join("book.toml");
        fs::write(&book, DEFAULT_RULEBOOK_TOML).expect("write rulebook");

        let clean = dir.path().join("clean.txt");
        fs::write(&clean, "The lantern flickers as you step inside.").expect("write");
        lexicon(dir.path(), &clean, Some(&book)).expect("clean text passes");

        let idiom = dir.path().join("idiom.txt");
        fs::write(&idiom, "You will bloody well listen.").expect("write");
        lexicon(dir.path(), &idiom, Some(&book)).expect("idiom is shielded");

        let profane = dir.path().join("profane.txt");
        fs::write(&profane, "Well, DAMN, the door is locked.").expect("write");
        let err = lexicon(dir.path(), &profane, Some(&book)).expect_err("profanity fires");
        assert!(err.to_string().contains("Violated"), "{err}");
    }
}
