use branchweave_core::{CandidateBranch, WeaveError};
use branchweave_core::sanitizer::{
    LoreFact, LoreSnapshot, NodeKind, OVERLAP_REVALIDATION_ID, Recommendation, RuleOutcome, Sanitizer,
    SanitizerSettings, Stage, StoryGraph, ValidationContext,
};
use branchweave_rules::RuleBook;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CLEAN_WORDS: &[&str] = &[
    "lantern", "harbor", "quietly", "the", "ferryman", "counted", "coins", "beneath", "a", "grey",
    "sky", "while", "gulls", "circled", "over", "nets", "and", "old", "rope", "smelled", "of", "salt",
];

fn ctx() -> ValidationContext {
    ValidationContext {
        phase: "rising".into(),
        story_graph: StoryGraph::default()
            .with_node("market_square", NodeKind::Decision)
            .with_node("keeper_musing", NodeKind::Monologue),
        lore: LoreSnapshot {
            facts: vec![LoreFact {
                id: "keeper_alive".into(),
                statement: "The lighthouse keeper is alive.".into(),
                contradicted_by: vec!["the late keeper".into()],
            }],
        },
        ..ValidationContext::default()
    }
}

fn sanitizer() -> Sanitizer {
    Sanitizer::with_defaults().expect("embedded rulebook parses")
}

fn clean_text(rng: &mut StdRng) -> String {
    let n = rng.gen_range(12..60);
    let words: Vec<&str> = (0..n).map(|_| CLEAN_WORDS[rng.gen_range(0..CLEAN_WORDS.len())]).collect();
    format!("{}.", words.join(" "))
}

#[test]
fn validation_is_byte_identical_across_runs_and_instances() {
    let c = CandidateBranch::new(
        "b1",
        "The innkeeper swore. Damn the weather, she said, and poured another round for the travellers.",
        "market_square",
        "ctx",
    );
    let a = sanitizer().validate(&c, &ctx()).to_canonical_json().expect("json");
    let b = sanitizer().validate(&c, &ctx()).to_canonical_json().expect("json");
    assert_eq!(a, b);

    let mut rng = StdRng::seed_from_u64(7);
    let s = sanitizer();
    for i in 0..25 {
        let c = CandidateBranch::new(format!("r{i}"), clean_text(&mut rng), "market_square", "ctx");
        let first = s.validate(&c, &ctx()).to_canonical_json().expect("json");
        let second = s.validate(&c, &ctx()).to_canonical_json().expect("json");
        assert_eq!(first, second);
    }
}

#[test]
fn clean_text_is_left_alone_by_sanitize() {
    let s = sanitizer();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..50 {
        let text = clean_text(&mut rng);
        assert_eq!(s.sanitize(&text, &ctx()), text);
    }
}

#[test]
fn sanitize_is_idempotent_on_its_own_output() {
    let s = sanitizer();
    let dirty = "What a damn mess.  \r\nThe <u>crap</u> boat sank.";
    let once = s.sanitize(dirty, &ctx());
    assert_ne!(once, dirty);
    assert_eq!(s.sanitize(&once, &ctx()), once);
}

#[test]
fn one_profane_word_is_redacted_and_branch_auto_accepted() {
    let original = "The innkeeper swore. Damn the weather, she said, and poured another round for the travellers.";
    let c = CandidateBranch::new("b1", original, "market_square", "ctx");
    let report = sanitizer().validate(&c, &ctx());

    assert_eq!(report.recommendation, Recommendation::AutoAccept);
    let lex = report.result("lexicon:profanity").expect("profanity result");
    assert_eq!(lex.result, RuleOutcome::Sanitized);
    assert_eq!(lex.diffs.len(), 1);
    assert_eq!(lex.diffs[0].before, "Damn");

    let revision = report.revision.as_ref().expect("sanitized revision");
    let placeholder = SanitizerSettings::default().placeholder;
    assert_eq!(revision.content, original.replacen("Damn", &placeholder, 1));
    assert!(revision.content.len().abs_diff(original.len()) <= placeholder.len());
    assert_eq!(revision.provenance.original_id, "b1");
    assert_eq!(revision.provenance.rule_ids, vec!["lexicon:profanity".to_string()]);
    // the submitted candidate is never mutated
    assert_eq!(c.content, original);
}

#[test]
fn unknown_return_path_goes_to_manual_review() {
    let c = CandidateBranch::new(
        "b2",
        "The ferryman counted his coins beneath a grey sky while the gulls circled the nets.",
        "the_lost_pier",
        "ctx",
    );
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::ManualReview);
    assert!(report.failed("return_path_reachability_check"));
}

#[test]
fn monologue_return_path_is_only_a_warning() {
    let c = CandidateBranch::new(
        "b3",
        "The ferryman counted his coins beneath a grey sky while the gulls circled the nets.",
        "keeper_musing",
        "ctx",
    );
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::AutoAccept);
    let r = report.result("return_path_plausibility_check").expect("plausibility result");
    assert_eq!(r.result, RuleOutcome::Warning);
}

#[test]
fn structural_failure_skips_every_later_stage() {
    let c = CandidateBranch::new("b4", "<i>An unclosed damn tag", "market_square", "ctx");
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::AutoReject);
    assert!(report.failed("markup_syntax_check"));
    assert!(report.results.iter().all(|r| r.stage == Stage::Structural));
    assert!(report.revision.is_none());

    let empty = CandidateBranch::new("b5", "   ", "market_square", "ctx");
    assert!(sanitizer().validate(&empty, &ctx()).failed("encoding_validity_check"));
}

#[test]
fn unsanitizable_critical_rejects() {
    let c = CandidateBranch::new(
        "b6",
        "The raiders called the villagers an inferior race and laughed by the fire.",
        "market_square",
        "ctx",
    );
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::AutoReject);
    assert!(report.has_unsanitized_critical());
    assert!(report.revision.is_none());
}

#[test]
fn fragment_markup_is_checked_too() {
    let c = CandidateBranch::new(
        "b7",
        "The ferryman counted his coins beneath a grey sky while the gulls circled the nets.",
        "market_square",
        "ctx",
    )
    .with_fragment("<choice>Pay the toll<choice>");
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::AutoReject);
}

#[test]
fn lore_contradiction_downgrades_to_review() {
    let c = CandidateBranch::new(
        "b8",
        "Villagers left flowers at the door of the late keeper, whispering about the storm.",
        "market_square",
        "ctx",
    );
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::ManualReview);
    assert!(report.failed("lore_continuity_check"));
}

#[test]
fn strict_validation_turns_coherence_failures_into_errors() {
    let s = sanitizer();
    let contradicting = CandidateBranch::new(
        "b8",
        "Villagers left flowers at the door of the late keeper, whispering about the storm.",
        "market_square",
        "ctx",
    );
    let err = s.validate_strict(&contradicting, &ctx()).expect_err("lore contradiction");
    match err {
        WeaveError::CoherenceWarning { branch_id, reason } => {
            assert_eq!(branch_id, "b8");
            assert!(reason.starts_with("lore_continuity_check"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }

    // return-path findings are not coherence findings
    let unreachable = CandidateBranch::new(
        "b2",
        "The ferryman counted his coins beneath a grey sky while the gulls circled the nets.",
        "the_lost_pier",
        "ctx",
    );
    let report = s.validate_strict(&unreachable, &ctx()).expect("no coherence failure");
    assert_eq!(report, s.validate(&unreachable, &ctx()));
}

#[test]
fn overlapping_transforms_are_revalidated_once() {
    let book = RuleBook::from_toml_str(
        r#"
name = "overlap"
version = "0.1.0"

[[rules]]
id = "mild"
severity = "critical"
sanitizable = true
terms = ["bloody"]

[[rules]]
id = "oath"
severity = "high"
sanitizable = true
phrases = ["bloody hell"]
"#,
    )
    .expect("rulebook parses");
    let s = Sanitizer::new(book, SanitizerSettings::default()).expect("sanitizer");
    let c = CandidateBranch::new(
        "b9",
        "Bloody hell, the bridge is out and the river keeps rising past the old stone markers.",
        "market_square",
        "ctx",
    );
    let report = s.validate(&c, &ctx());
    let check = report.result(OVERLAP_REVALIDATION_ID).expect("overlap re-validation recorded");
    assert_eq!(check.result, RuleOutcome::Passed);
    assert_eq!(report.recommendation, Recommendation::AutoAccept);
    let revision = report.revision.expect("revision");
    assert!(revision.content.starts_with("[redacted] hell"));
    assert_eq!(report.ruleset_version, "0.1.0");
}

#[test]
fn disallowed_markup_and_whitespace_are_repaired() {
    let c = CandidateBranch::new(
        "b10",
        "The ferryman <u>counted</u> his coins beneath a grey sky while the gulls circled.   \r\n",
        "market_square",
        "ctx",
    );
    let report = sanitizer().validate(&c, &ctx());
    assert_eq!(report.recommendation, Recommendation::AutoAccept);
    let revision = report.revision.as_ref().expect("revision");
    assert_eq!(
        revision.content,
        "The ferryman counted his coins beneath a grey sky while the gulls circled."
    );
    assert_eq!(
        report.result("markup_filter_check").map(|r| r.result),
        Some(RuleOutcome::Sanitized)
    );
}
