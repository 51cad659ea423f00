//! Challenge catalog and validation
//!
//! A challenge is a list of input/expected pairs. Each pair gets its own
//! run on the challenge timeout tier; the candidate passes only if every
//! pair does.

use crate::collab::ProgressStore;
use crate::engine::{RunJob, Runner};
use crate::result::ExecutionResult;
use crate::{Result, SandpitError};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: Json,
    pub expected: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub pass: bool,
    pub input: Json,
    pub expected: Json,
    pub actual: Json,
    /// Message of the thrown error or timeout, when the run faulted
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Function called with each input; without it the input is not bound
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Challenge {
    /// Source actually run for one test case
    fn program(&self, source: &str, input: &Json) -> String {
        match &self.entry_point {
            Some(entry) => format!("{source}\n{entry}({input});\n"),
            None => source.to_owned(),
        }
    }
}

/// Listing view without the test cases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub test_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChallengeCatalog {
    challenges: Vec<Challenge>,
}

impl ChallengeCatalog {
    #[must_use]
    pub const fn from_challenges(challenges: Vec<Challenge>) -> Self {
        Self { challenges }
    }

    /// Load a catalog from a JSON array of challenges
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let challenges: Vec<Challenge> = serde_json::from_str(&raw)?;

        let mut seen = std::collections::HashSet::new();
        for challenge in &challenges {
            if !seen.insert(challenge.id.as_str()) {
                return Err(SandpitError::Config(format!(
                    "duplicate challenge id {:?} in {}",
                    challenge.id,
                    path.display()
                )));
            }
        }

        tracing::info!(path = %path.display(), count = challenges.len(), "challenge catalog loaded");
        Ok(Self { challenges })
    }

    pub fn get(&self, id: &str) -> Result<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| SandpitError::ChallengeNotFound(id.to_owned()))
    }

    #[must_use]
    pub fn list(&self) -> Vec<ChallengeSummary> {
        self.challenges
            .iter()
            .map(|c| ChallengeSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                description: c.description.clone(),
                test_count: c.test_cases.len(),
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    pub results: Vec<TestResult>,
    pub message: String,
}

/// Runs a candidate against every test case of a challenge
pub struct Validator<R> {
    runner: R,
    timeout: Duration,
    progress: Option<Arc<dyn ProgressStore>>,
}

impl<R: Runner> Validator<R> {
    #[must_use]
    pub const fn new(runner: R, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(store);
        self
    }

    pub fn validate(&self, challenge: &Challenge, source: &str) -> Result<ValidationReport> {
        if challenge.test_cases.is_empty() {
            return Ok(ValidationReport {
                success: false,
                results: Vec::new(),
                message: "Challenge has no test cases".into(),
            });
        }

        let mut results = Vec::with_capacity(challenge.test_cases.len());
        for case in &challenge.test_cases {
            let job = RunJob::new(challenge.program(source, &case.input), self.timeout);
            let outcome = self.runner.run(job)?;
            results.push(judge(case, &outcome));
        }

        let total = results.len();
        let failed = results.iter().filter(|r| !r.pass).count();
        let success = failed == 0;

        tracing::info!(challenge = %challenge.id, total, failed, "challenge validated");

        if success {
            self.record(&challenge.id, source);
        }

        Ok(ValidationReport {
            success,
            results,
            message: if success {
                "All tests passed!".into()
            } else {
                format!("{failed} of {total} tests failed")
            },
        })
    }

    fn record(&self, challenge_id: &str, source: &str) {
        let Some(progress) = &self.progress else {
            return;
        };
        if let Err(e) = progress.record_completion(challenge_id, source) {
            tracing::warn!(challenge = %challenge_id, error = %e, "failed to record completion");
        }
    }
}

/// Last log line if anything was logged, otherwise the return value
#[must_use]
pub fn actual_value(result: &ExecutionResult) -> Json {
    result
        .log_entries
        .last()
        .map_or_else(|| result.return_value.clone(), |line| Json::String(line.clone()))
}

/// Exact equality of the compact serializations
#[must_use]
pub fn matches(actual: &Json, expected: &Json) -> bool {
    match (serde_json::to_string(actual), serde_json::to_string(expected)) {
        (Ok(a), Ok(e)) => a == e,
        _ => false,
    }
}

fn judge(case: &TestCase, result: &ExecutionResult) -> TestResult {
    let actual = actual_value(result);
    let error = result.thrown_error.as_ref().map(|e| e.message.clone());
    TestResult {
        pass: error.is_none() && matches(&actual, &case.expected),
        input: case.input.clone(),
        expected: case.expected.clone(),
        actual,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryProgressStore;
    use crate::{Engine, SandboxConfig};
    use serde_json::json;
    use std::io::Write;

    fn engine() -> Engine {
        Engine::new(SandboxConfig::builder().allow_network(false).build())
    }

    fn fizz() -> Challenge {
        Challenge {
            id: "fizzbuzz".into(),
            title: "FizzBuzz".into(),
            description: String::new(),
            entry_point: Some("fizzbuzz".into()),
            test_cases: vec![
                TestCase { input: json!(3), expected: json!("Fizz") },
                TestCase { input: json!(5), expected: json!("Buzz") },
                TestCase { input: json!(7), expected: json!("7") },
            ],
        }
    }

    const FIZZBUZZ: &str = "function fizzbuzz(n) {\n\
        if (n % 15 === 0) { console.log('FizzBuzz'); return; }\n\
        if (n % 3 === 0) { console.log('Fizz'); return; }\n\
        if (n % 5 === 0) { console.log('Buzz'); return; }\n\
        console.log(String(n));\n\
    }";

    #[test]
    fn all_passing_records_completion() {
        let progress = Arc::new(MemoryProgressStore::default());
        let validator = Validator::new(engine(), Duration::from_secs(2))
            .with_progress(Arc::clone(&progress) as Arc<dyn ProgressStore>);

        let report = validator.validate(&fizz(), FIZZBUZZ).unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.message, "All tests passed!");
        assert!(progress.is_completed("fizzbuzz"));
    }

    #[test]
    fn one_failure_suppresses_completion() {
        let progress = Arc::new(MemoryProgressStore::default());
        let validator = Validator::new(engine(), Duration::from_secs(2))
            .with_progress(Arc::clone(&progress) as Arc<dyn ProgressStore>);

        let wrong = "function fizzbuzz(n) { console.log(n % 3 === 0 ? 'Fizz' : String(n)); }";
        let report = validator.validate(&fizz(), wrong).unwrap();
        assert!(!report.success);
        assert_eq!(report.message, "1 of 3 tests failed");
        assert!(!report.results[1].pass);
        assert_eq!(report.results[1].actual, json!("5"));
        assert!(progress.completions().is_empty());
    }

    #[test]
    fn empty_challenge_fails() {
        let mut challenge = fizz();
        challenge.test_cases.clear();
        let report = Validator::new(engine(), Duration::from_secs(2))
            .validate(&challenge, FIZZBUZZ)
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.message, "Challenge has no test cases");
    }

    #[test]
    fn faulted_case_carries_the_error() {
        let report = Validator::new(engine(), Duration::from_secs(2))
            .validate(&fizz(), "function fizzbuzz() { throw new Error('nope'); }")
            .unwrap();
        assert_eq!(report.results[0].error.as_deref(), Some("nope"));
        assert!(!report.results[0].pass);
    }

    #[test]
    fn return_value_is_used_when_nothing_logged() {
        let mut challenge = fizz();
        challenge.entry_point = Some("double".into());
        challenge.test_cases = vec![TestCase { input: json!([1, 2]), expected: json!([2, 4]) }];
        let report = Validator::new(engine(), Duration::from_secs(2))
            .validate(&challenge, "function double(xs) { return xs.map(function (x) { return x * 2; }); }")
            .unwrap();
        assert!(report.success, "{report:?}");
    }

    #[test]
    fn comparison_is_by_serialized_form() {
        assert!(matches(&json!("Fizz"), &json!("Fizz")));
        assert!(!matches(&json!("3"), &json!(3)));
        assert!(!matches(&json!({"a": 1, "b": 2}), &json!({"b": 2, "a": 1})));
    }

    #[test]
    fn catalog_loads_and_rejects_duplicates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "sum", "title": "Sum", "entryPoint": "sum", "testCases": [{{"input": [1, 2], "expected": 3}}]}}]"#
        )
        .unwrap();
        let catalog = ChallengeCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(ChallengeCatalog::default().is_empty());
        assert_eq!(catalog.list()[0].test_count, 1);
        assert!(matches!(catalog.get("nope"), Err(SandpitError::ChallengeNotFound(_))));

        let mut dup = tempfile::NamedTempFile::new().unwrap();
        write!(dup, r#"[{{"id": "a", "title": "A"}}, {{"id": "a", "title": "B"}}]"#).unwrap();
        assert!(matches!(ChallengeCatalog::load(dup.path()), Err(SandpitError::Config(_))));
    }
}
