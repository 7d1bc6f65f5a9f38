use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "branchweave.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    /// Defaults with every relative path anchored at `root`.
    pub fn rooted(root: &Path) -> Self {
        let mut cfg = CoreConfig::default();
        cfg.resolve_paths(root);
        cfg
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.rules.path = absolutize(root, &self.rules.path);
        self.checkpoints.path = absolutize(root, &self.checkpoints.path);
        self.audit.log_path = absolutize(root, &self.audit.log_path);
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "branchweave".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self { name: Self::default_name() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RulesConfig {
    #[serde(default = "RulesConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "RulesConfig::default_rulebook")]
    pub rulebook: String,
    /// Restore the embedded rulebook whenever the on-disk copy drifts.
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "RulesConfig::default_placeholder")]
    pub placeholder: String,
    #[serde(default = "RulesConfig::default_allowed_markup")]
    pub allowed_markup: Vec<String>,
    #[serde(default = "RulesConfig::default_theme_drift_tolerance")]
    pub theme_drift_tolerance: usize,
}

impl RulesConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("rules")
    }
    fn default_rulebook() -> String {
        branchweave_rules::assets::DEFAULT_RULEBOOK_NAME.to_string()
    }
    fn default_placeholder() -> String {
        "[redacted]".to_string()
    }
    fn default_allowed_markup() -> Vec<String> {
        ["i", "b", "em", "strong", "pause", "say", "choice"]
            .into_iter()
            .map(String::from)
            .collect()
    }
    fn default_theme_drift_tolerance() -> usize {
        2
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            rulebook: Self::default_rulebook(),
            locked: false,
            placeholder: Self::default_placeholder(),
            allowed_markup: Self::default_allowed_markup(),
            theme_drift_tolerance: Self::default_theme_drift_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecisionConfig {
    #[serde(default = "DecisionConfig::default_risk_threshold")]
    pub risk_threshold: f64,
    /// Manual-review results below this score auto-approve. Absent means reject.
    #[serde(default)]
    pub auto_approve_below: Option<f64>,
    #[serde(default)]
    pub weights: RiskWeights,
    #[serde(default)]
    pub similarity_enabled: bool,
}

impl DecisionConfig {
    fn default_risk_threshold() -> f64 {
        0.5
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            risk_threshold: Self::default_risk_threshold(),
            auto_approve_below: None,
            weights: RiskWeights::default(),
            similarity_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RiskWeights {
    #[serde(default = "RiskWeights::default_validation")]
    pub validation: f64,
    #[serde(default = "RiskWeights::default_pacing")]
    pub pacing: f64,
    #[serde(default = "RiskWeights::default_return_path")]
    pub return_path: f64,
    #[serde(default = "RiskWeights::default_similarity")]
    pub similarity: f64,
}

impl RiskWeights {
    fn default_validation() -> f64 {
        0.6
    }
    fn default_pacing() -> f64 {
        0.2
    }
    fn default_return_path() -> f64 {
        0.2
    }
    fn default_similarity() -> f64 {
        0.2
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            validation: Self::default_validation(),
            pacing: Self::default_pacing(),
            return_path: Self::default_return_path(),
            similarity: Self::default_similarity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PhaseTarget {
    pub min_chars: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacingConfig {
    #[serde(default = "PacingConfig::default_target")]
    pub default: PhaseTarget,
    #[serde(default = "PacingConfig::default_phases")]
    pub phases: BTreeMap<String, PhaseTarget>,
}

impl PacingConfig {
    fn default_target() -> PhaseTarget {
        PhaseTarget { min_chars: 40, max_chars: 1200 }
    }

    fn default_phases() -> BTreeMap<String, PhaseTarget> {
        let mut m = BTreeMap::new();
        m.insert("exposition".to_string(), PhaseTarget { min_chars: 80, max_chars: 1600 });
        m.insert("rising".to_string(), PhaseTarget { min_chars: 60, max_chars: 1200 });
        m.insert("climax".to_string(), PhaseTarget { min_chars: 20, max_chars: 600 });
        m.insert("resolution".to_string(), PhaseTarget { min_chars: 40, max_chars: 900 });
        m
    }

    pub fn target_for(&self, phase: &str) -> PhaseTarget {
        self.phases.get(phase).copied().unwrap_or(self.default)
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            default: Self::default_target(),
            phases: Self::default_phases(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointsConfig {
    #[serde(default = "CheckpointsConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "CheckpointsConfig::default_schema_version")]
    pub schema_version: u32,
}

impl CheckpointsConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("checkpoints")
    }
    fn default_schema_version() -> u32 {
        1
    }
}

impl Default for CheckpointsConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            schema_version: Self::default_schema_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "AuditConfig::default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "AuditConfig::default_true")]
    pub enabled: bool,
    #[serde(default = "AuditConfig::default_preview_len")]
    pub preview_len: usize,
}

impl AuditConfig {
    fn default_log_path() -> PathBuf {
        PathBuf::from("logbook/audit.jsonl")
    }
    fn default_true() -> bool {
        true
    }
    fn default_preview_len() -> usize {
        160
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: Self::default_log_path(),
            enabled: true,
            preview_len: Self::default_preview_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HooksConfig {
    /// Wait bound per gated handler, and for a whole parallel fan-out.
    #[serde(default = "HooksConfig::default_gate_timeout_ms")]
    pub gate_timeout_ms: u64,
}

impl HooksConfig {
    fn default_gate_timeout_ms() -> u64 {
        250
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self { gate_timeout_ms: Self::default_gate_timeout_ms() }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[decision]\nrisk_threshold = 0.3\n\n[pacing.phases.epilogue]\nmin_chars = 1\nmax_chars = 10\n",
        )
        .unwrap();
        let cfg = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.decision.risk_threshold, 0.3);
        assert!(cfg.decision.auto_approve_below.is_none());
        assert_eq!(cfg.pacing.target_for("epilogue").max_chars, 10);
        assert_eq!(cfg.pacing.target_for("unknown"), cfg.pacing.default);
        assert_eq!(cfg.checkpoints.path, dir.path().join("checkpoints"));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.hooks.gate_timeout_ms, 250);
        assert_eq!(cfg.rules.placeholder, "[redacted]");
    }
}
