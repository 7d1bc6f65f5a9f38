// Public modules so branchweave-core can use them
pub mod assets;
pub mod evaluator;
pub mod normalize;
pub mod types;

pub use assets::{
    default_rulebook_text, read_verified_or_embedded, write_default_rulebooks, LoadedRulebook, RulebookSource,
};
pub use evaluator::{evaluate_input_against_rules, load_rulebook_from_file, EvaluationResult, RuleMatch, Span};
pub use normalize::for_rules as normalize_for_rules;
pub use types::{Category, LexiconRule, RuleBook, Severity};

/// Parse the rulebook compiled into this crate.
pub fn default_rulebook() -> Result<RuleBook, toml::de::Error> {
    RuleBook::from_toml_str(assets::DEFAULT_RULEBOOK_TOML)
}
