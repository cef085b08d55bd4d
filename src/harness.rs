//! Validation harness: replay fixtures through the full decode path and
//! score the result field by field.
//!
//! A field counts only if at least one of its expected bytes is known, and
//! it matches when every known byte agrees. Accuracy is matched fields over
//! scored fields, in percent. A candidate strategy is accepted only if its
//! accuracy does not fall below the accepted baseline.
//!
//! # Example
//!
//! ```
//! use mirwire::harness::ValidationHarness;
//! use mirwire::schedule::{EngineConfig, FixtureTable, KeyScheduleEngine, ObservedKeySchedule};
//!
//! let fixtures = FixtureTable::builtin().unwrap();
//! let engine = KeyScheduleEngine::unvalidated(ObservedKeySchedule::builtin(), EngineConfig::default());
//!
//! let report = ValidationHarness::run(&engine, &fixtures).unwrap();
//! assert_eq!(report.accuracy(), 100.0);
//! ```

use serde::Serialize;

use crate::codec::{ExtensionCodec, Field, FieldCodec};
use crate::error::{HarnessError, Result};
use crate::protocol::{spaced_hex, Sequence};
use crate::schedule::{masked_hex, Fixture, FixtureTable, KeyConfidence, KeyContext, KeyScheduleEngine};

/// Tolerance when comparing accuracies.
const ACCURACY_EPSILON: f64 = 1e-9;

/// One field that did not decode as expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiff {
    pub field: Field,
    /// Expected bytes, `??` where unknown.
    pub expected: String,
    /// Decoded bytes (empty when nothing decoded).
    pub actual: String,
}

/// Result of replaying one fixture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameOutcome {
    pub label: String,
    pub sequence: Sequence,
    pub function_code: u16,
    /// Function code the engine settled on.
    pub detected: Option<u16>,
    pub confidence: Option<KeyConfidence>,
    pub matched: bool,
    pub scored_fields: usize,
    pub matched_fields: usize,
    pub diffs: Vec<FieldDiff>,
    /// Extension text under the resolved key.
    pub text: Option<String>,
    /// Whether that text equals the fixture's; `None` when the fixture has none.
    pub text_matched: Option<bool>,
    /// Decode error, when the engine refused the frame.
    pub error: Option<String>,
}

/// Match counts for one field across the corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldTally {
    pub scored: usize,
    pub matched: usize,
}

/// Aggregate harness result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessReport {
    pub strategy: String,
    pub outcomes: Vec<FrameOutcome>,
    pub fields: Vec<(Field, FieldTally)>,
}

impl HarnessReport {
    /// Percentage of scored fields that matched.
    pub fn accuracy(&self) -> f64 {
        let (scored, matched) = self.totals();
        if scored == 0 {
            return 0.0;
        }
        matched as f64 * 100.0 / scored as f64
    }

    /// (scored, matched) field counts.
    pub fn totals(&self) -> (usize, usize) {
        self.fields
            .iter()
            .fold((0, 0), |(s, m), (_, t)| (s + t.scored, m + t.matched))
    }

    /// Number of frames whose every scored field matched.
    pub fn matched_frames(&self) -> usize {
        self.outcomes.iter().filter(|o| o.matched).count()
    }

    /// Outcome by fixture label.
    pub fn outcome(&self, label: &str) -> Option<&FrameOutcome> {
        self.outcomes.iter().find(|o| o.label == label)
    }

    /// Tally for one field.
    pub fn field(&self, field: Field) -> FieldTally {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, t)| *t)
            .unwrap_or_default()
    }

    /// Fail if accuracy fell below `baseline` percent.
    pub fn check_baseline(&self, baseline: f64) -> std::result::Result<(), HarnessError> {
        let accuracy = self.accuracy();
        if accuracy + ACCURACY_EPSILON < baseline {
            return Err(HarnessError::Regression { accuracy, baseline });
        }
        Ok(())
    }

    /// Frame-level differences between a candidate and a baseline report.
    pub fn compare(candidate: &HarnessReport, baseline: &HarnessReport) -> Comparison {
        let mut regressed = Vec::new();
        let mut improved = Vec::new();
        for outcome in &candidate.outcomes {
            let Some(before) = baseline.outcome(&outcome.label) else {
                continue;
            };
            match (before.matched, outcome.matched) {
                (true, false) => regressed.push(outcome.label.clone()),
                (false, true) => improved.push(outcome.label.clone()),
                _ => {}
            }
        }
        Comparison {
            accuracy_delta: candidate.accuracy() - baseline.accuracy(),
            regressed,
            improved,
        }
    }
}

/// Candidate vs. baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    /// Candidate accuracy minus baseline accuracy, in points.
    pub accuracy_delta: f64,
    /// Frames that matched before and no longer do.
    pub regressed: Vec<String>,
    /// Frames that now match and did not before.
    pub improved: Vec<String>,
}

impl Comparison {
    /// No aggregate loss.
    pub fn is_acceptable(&self) -> bool {
        self.accuracy_delta + ACCURACY_EPSILON >= 0.0
    }
}

/// Replays fixture corpora through the decode path.
pub struct ValidationHarness;

impl ValidationHarness {
    /// Score `engine` against every fixture.
    pub fn run(
        engine: &KeyScheduleEngine,
        fixtures: &FixtureTable,
    ) -> std::result::Result<HarnessReport, HarnessError> {
        if fixtures.is_empty() {
            return Err(HarnessError::EmptyCorpus);
        }

        let mut tallies: Vec<(Field, FieldTally)> =
            Field::ALL.iter().map(|f| (*f, FieldTally::default())).collect();
        let outcomes: Vec<FrameOutcome> = fixtures
            .iter()
            .map(|fixture| {
                let outcome = replay(engine, fixture, &mut tallies);
                if !outcome.matched {
                    tracing::debug!(
                        label = %outcome.label,
                        diffs = outcome.diffs.len(),
                        error = ?outcome.error,
                        "fixture mismatch"
                    );
                }
                outcome
            })
            .collect();

        let report = HarnessReport {
            strategy: engine.strategy_name().to_string(),
            outcomes,
            fields: tallies,
        };
        tracing::debug!(
            strategy = %report.strategy,
            accuracy = report.accuracy(),
            frames = report.outcomes.len(),
            matched = report.matched_frames(),
            "harness run complete"
        );
        Ok(report)
    }

    /// Run and reject the candidate if it regresses below `baseline` percent.
    pub fn accept(
        candidate: &KeyScheduleEngine,
        fixtures: &FixtureTable,
        baseline: f64,
    ) -> Result<HarnessReport> {
        let report = Self::run(candidate, fixtures)?;
        report.check_baseline(baseline)?;
        Ok(report)
    }
}

fn replay(
    engine: &KeyScheduleEngine,
    fixture: &Fixture,
    tallies: &mut [(Field, FieldTally)],
) -> FrameOutcome {
    let frame = fixture.frame();
    let decoded = engine
        .resolve(frame, &KeyContext::default())
        .map(|resolved| {
            let plain = FieldCodec::decode(frame.body(), resolved.key.bytes()).to_plain();
            (resolved, plain)
        });

    let mut outcome = FrameOutcome {
        label: fixture.label().to_string(),
        sequence: fixture.sequence(),
        function_code: fixture.function_code(),
        detected: None,
        confidence: None,
        matched: true,
        scored_fields: 0,
        matched_fields: 0,
        diffs: Vec::new(),
        text: None,
        text_matched: None,
        error: None,
    };

    let plain = match decoded {
        Ok((resolved, plain)) => {
            outcome.detected = Some(resolved.function_code);
            outcome.confidence = Some(resolved.key.confidence().clone());
            outcome.text = ExtensionCodec::decode_text(frame.extension(), resolved.key.extension());
            Some(plain)
        }
        Err(err) => {
            outcome.error = Some(err.to_string());
            None
        }
    };

    // Text is checked per frame but stays out of the field tallies.
    if let Some(expected) = fixture.text() {
        let hit = outcome.text.as_deref() == Some(expected);
        outcome.text_matched = Some(hit);
        outcome.matched &= hit;
    }

    for (field, tally) in tallies.iter_mut() {
        let range = field.range();
        let expected = &fixture.expected()[range.clone()];
        if expected.iter().all(Option::is_none) {
            continue;
        }

        tally.scored += 1;
        outcome.scored_fields += 1;

        let actual = plain.as_ref().map(|p| &p[range]);
        let hit = actual.is_some_and(|actual| {
            expected
                .iter()
                .zip(actual)
                .all(|(e, a)| e.map_or(true, |e| e == *a))
        });

        if hit {
            tally.matched += 1;
            outcome.matched_fields += 1;
        } else {
            outcome.matched = false;
            outcome.diffs.push(FieldDiff {
                field: *field,
                expected: masked_hex(expected),
                actual: actual.map(spaced_hex).unwrap_or_default(),
            });
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{EngineConfig, FunctionTableSchedule, ObservedKeySchedule};

    fn fixtures() -> FixtureTable {
        FixtureTable::builtin().unwrap()
    }

    fn observed() -> KeyScheduleEngine {
        KeyScheduleEngine::unvalidated(ObservedKeySchedule::builtin(), EngineConfig::default())
    }

    fn legacy() -> KeyScheduleEngine {
        KeyScheduleEngine::unvalidated(FunctionTableSchedule, EngineConfig::default())
    }

    #[test]
    fn test_observed_schedule_scores_full_marks() {
        let report = ValidationHarness::run(&observed(), &fixtures()).unwrap();

        assert_eq!(report.accuracy(), 100.0);
        assert_eq!(report.matched_frames(), 7);
        assert_eq!(report.totals(), (35, 35));
        assert!(report.check_baseline(100.0).is_ok());

        let dialog = report.outcome("npc dialog option").unwrap();
        assert_eq!(dialog.text.as_deref(), Some("@加入骑士团1(0,58,初阶)"));
        assert_eq!(dialog.text_matched, Some(true));
        assert_eq!(report.outcome("move").unwrap().text_matched, None);
    }

    #[test]
    fn test_wrong_text_fails_the_frame() {
        let fixtures = fixtures();
        let scroll = fixtures.get("use item (town scroll)").unwrap();
        let relabelled = Fixture::new("scroll, other text", scroll.frame().clone(), *scroll.expected())
            .unwrap()
            .with_text("回城卷")
            .unwrap();
        let report = ValidationHarness::run(&observed(), &FixtureTable::new().with(relabelled)).unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.text.as_deref(), Some("回城石"));
        assert_eq!(outcome.text_matched, Some(false));
        assert!(!outcome.matched);
        assert_eq!(report.accuracy(), 100.0);
    }

    #[test]
    fn test_unknown_bytes_are_not_scored() {
        let report = ValidationHarness::run(&observed(), &fixtures()).unwrap();

        // Only the two fully known move captures say anything about param5.
        assert_eq!(report.field(Field::Param5).scored, 2);
        let npc = report.outcome("click npc").unwrap();
        assert_eq!(npc.scored_fields, 4);
    }

    #[test]
    fn test_function_table_regresses() {
        let report = ValidationHarness::run(&legacy(), &fixtures()).unwrap();

        assert_eq!(report.strategy, "function-table");
        let (scored, matched) = report.totals();
        assert_eq!(scored, 35);
        assert!(matched < scored);
        assert!(report.accuracy() < 70.0);

        let seq3 = report.outcome("move legacy coordinates").unwrap();
        assert_eq!(seq3.detected, Some(0x0BC5));
        assert!(!seq3.matched);
        assert_eq!(seq3.diffs[0].field, Field::FunctionCode);
        assert_eq!(seq3.diffs[0].expected, "C3 0B");
        assert_eq!(seq3.diffs[0].actual, "C5 0B");

        let err = report.check_baseline(100.0).unwrap_err();
        assert!(matches!(err, HarnessError::Regression { .. }));
    }

    #[test]
    fn test_compare_lists_regressed_frames() {
        let baseline = ValidationHarness::run(&observed(), &fixtures()).unwrap();
        let candidate = ValidationHarness::run(&legacy(), &fixtures()).unwrap();

        let cmp = HarnessReport::compare(&candidate, &baseline);
        assert!(!cmp.is_acceptable());
        assert!(cmp.regressed.contains(&"move legacy coordinates".to_string()));
        assert!(cmp.improved.is_empty());

        let reverse = HarnessReport::compare(&baseline, &candidate);
        assert!(reverse.is_acceptable());
        assert_eq!(reverse.regressed, Vec::<String>::new());
    }

    #[test]
    fn test_accept_gate() {
        assert!(ValidationHarness::accept(&observed(), &fixtures(), 100.0).is_ok());
        assert!(ValidationHarness::accept(&legacy(), &fixtures(), 90.0).is_err());
    }

    #[test]
    fn test_empty_corpus() {
        let err = ValidationHarness::run(&observed(), &FixtureTable::new()).unwrap_err();
        assert_eq!(err, HarnessError::EmptyCorpus);
    }

    #[test]
    fn test_refused_frames_score_zero() {
        let poisoned = KeyScheduleEngine::new(FunctionTableSchedule, fixtures(), EngineConfig::default());
        let report = ValidationHarness::run(&poisoned, &fixtures()).unwrap();

        assert_eq!(report.accuracy(), 0.0);
        assert!(report.outcomes.iter().all(|o| o.error.is_some()));
    }
}
