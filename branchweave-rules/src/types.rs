use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleBook {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Vec<LexiconRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Higher is worse. Kept numeric so callers can sort critical-first.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Profanity,
    Explicit,
    Hate,
    Other,
}

impl Default for Category {
    fn default() -> Self {
        Category::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LexiconRule {
    pub id: String,

    #[serde(default)]
    pub category: Category,

    pub severity: Severity,

    // Single words, matched on word boundaries
    #[serde(default)]
    pub terms: Vec<String>,

    // Multi-word phrases, matched as normalized substrings
    #[serde(default)]
    pub phrases: Vec<String>,

    // Whether a hit can be redacted in place instead of rejecting the branch
    #[serde(default)]
    pub sanitizable: bool,

    // "allow" marks an idiom allowlist entry: its phrases shield overlapping hits
    #[serde(default)]
    pub effect: Option<String>,

    #[serde(default)]
    pub suggestion: Option<String>,
}

impl LexiconRule {
    pub fn is_allow(&self) -> bool {
        self.effect
            .as_deref()
            .map(|e| e.eq_ignore_ascii_case("allow"))
            .unwrap_or(false)
    }
}

impl RuleBook {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Canonical TOML form: fields in declaration order, comments and layout dropped.
    pub fn to_canonical_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// blake3 of [`RuleBook::to_canonical_toml`]. Formatting-only edits keep the digest.
    pub fn digest(&self) -> Result<String, toml::ser::Error> {
        let canonical = self.to_canonical_toml()?;
        Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    /// Enforcement rules ordered critical-first; declaration order breaks ties.
    pub fn enforcement_rules(&self) -> Vec<&LexiconRule> {
        let mut rules: Vec<&LexiconRule> = self.rules.iter().filter(|r| !r.is_allow()).collect();
        rules.sort_by(|a, b| b.severity.rank().cmp(&a.severity.rank()));
        rules
    }

    pub fn allow_rules(&self) -> impl Iterator<Item = &LexiconRule> {
        self.rules.iter().filter(|r| r.is_allow())
    }
}
