use std::collections::BTreeMap;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Outcome of a single attempt at a single test.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultKind {
    Pass,
    Fail,
    Crash,
    Timeout,
    Unknown,
    Skip,
}

impl ResultKind {
    pub const ALL: [ResultKind; 6] = [
        ResultKind::Pass,
        ResultKind::Fail,
        ResultKind::Crash,
        ResultKind::Timeout,
        ResultKind::Unknown,
        ResultKind::Skip,
    ];

    /// Whether a result of this kind makes a run unsuccessful.
    /// Skipped tests were never expected to run, so they do not count against a run.
    pub fn is_failing(self) -> bool {
        !matches!(self, ResultKind::Pass | ResultKind::Skip)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Pass => "PASS",
            ResultKind::Fail => "FAIL",
            ResultKind::Crash => "CRASH",
            ResultKind::Timeout => "TIMEOUT",
            ResultKind::Unknown => "UNKNOWN",
            ResultKind::Skip => "SKIP",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    name: String,
    kind: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log: Option<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, kind: ResultKind) -> Self {
        Self {
            name: name.into(),
            kind,
            log: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn log(&self) -> Option<&str> {
        self.log.as_deref()
    }

    /// Prefixes the name with a tag, e.g. the identity of the device the result came from.
    pub fn tagged(mut self, tag: &str) -> Self {
        self.name = format!("{tag}_{}", self.name);
        self
    }
}

/// An append-only multiset of test results.
///
/// A test may appear more than once, e.g. once per attempt. Consumers that want one result per
/// test should use [ResultSet::latest_by_name], which treats the last recorded attempt as
/// authoritative.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct ResultSet {
    results: Vec<TestResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_result(&mut self, result: TestResult) {
        self.results.push(result);
    }

    pub fn add_results(&mut self, results: impl IntoIterator<Item = TestResult>) {
        self.results.extend(results);
    }

    /// Merges all results of another set into this one.
    pub fn merge(&mut self, other: ResultSet) {
        self.results.extend(other.results);
    }

    pub fn all(&self) -> &[TestResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn of_kind(&self, kind: ResultKind) -> impl Iterator<Item = &TestResult> + '_ {
        self.results.iter().filter(move |r| r.kind == kind)
    }

    pub fn passed(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.of_kind(ResultKind::Pass)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.of_kind(ResultKind::Fail)
    }

    pub fn crashed(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.of_kind(ResultKind::Crash)
    }

    pub fn timed_out(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.of_kind(ResultKind::Timeout)
    }

    pub fn unknown(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.of_kind(ResultKind::Unknown)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.of_kind(ResultKind::Skip)
    }

    /// All results that are not passes, skips included.
    pub fn not_passed(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.results.iter().filter(|r| r.kind != ResultKind::Pass)
    }

    pub fn did_run_pass(&self) -> bool {
        !self.results.iter().any(|r| r.kind.is_failing())
    }

    /// Deduplicated view: the last recorded result for each test name.
    pub fn latest_by_name(&self) -> BTreeMap<&str, &TestResult> {
        let mut latest = BTreeMap::new();
        for result in &self.results {
            latest.insert(result.name(), result);
        }
        latest
    }

    /// Returns a set holding only the passing results of this one.
    pub fn into_passing(self) -> ResultSet {
        let results = self
            .results
            .into_iter()
            .filter(|r| r.kind == ResultKind::Pass)
            .collect();
        ResultSet { results }
    }

    /// Tags every result name with `tag`.
    pub fn tagged(self, tag: &str) -> ResultSet {
        let results = self.results.into_iter().map(|r| r.tagged(tag)).collect();
        ResultSet { results }
    }

    fn count(&self, kind: ResultKind) -> usize {
        self.of_kind(kind).count()
    }

    /// One-line summary of counts per kind.
    pub fn short_form(&self) -> String {
        let mut s = format!("ALL ({} tests)", self.len());
        for kind in ResultKind::ALL {
            let count = self.count(kind);
            if count > 0 {
                s.push_str(&format!(", {kind}: {count}"));
            }
        }
        s
    }

    /// Multi-line summary naming every test that did not pass.
    pub fn long_form(&self) -> String {
        if self.did_run_pass() {
            return format!("{}\nAll tests passed.", self.short_form());
        }

        let mut lines = vec![self.short_form()];
        for kind in ResultKind::ALL {
            if !kind.is_failing() {
                continue;
            }
            let mut names: Vec<_> = self.of_kind(kind).map(TestResult::name).collect();
            if names.is_empty() {
                continue;
            }
            names.sort_unstable();
            names.dedup();
            lines.push(format!("{kind} ({}):", names.len()));
            lines.extend(names.into_iter().map(|name| format!("  {name}")));
        }
        lines.join("\n")
    }

    /// Logs attached to results that did not pass.
    pub fn failure_logs(&self) -> String {
        let mut s = String::new();
        for result in self.results.iter().filter(|r| r.kind.is_failing()) {
            if let Some(log) = result.log() {
                s.push_str(&format!("[{}] {}:\n{}\n", result.kind, result.name, log));
            }
        }
        s
    }
}

impl FromIterator<TestResult> for ResultSet {
    fn from_iter<I: IntoIterator<Item = TestResult>>(iter: I) -> Self {
        ResultSet {
            results: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ResultSet {
    type Item = TestResult;
    type IntoIter = std::vec::IntoIter<TestResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::{ResultKind, ResultSet, TestResult};

    fn set(results: &[(&str, ResultKind)]) -> ResultSet {
        results
            .iter()
            .map(|(name, kind)| TestResult::new(*name, *kind))
            .collect()
    }

    #[test]
    fn empty_set_passes() {
        assert!(ResultSet::new().did_run_pass());
    }

    #[test]
    fn skips_do_not_fail_a_run() {
        let results = set(&[("a", ResultKind::Pass), ("b", ResultKind::Skip)]);
        assert!(results.did_run_pass());
        assert_eq!(results.not_passed().count(), 1);
    }

    #[test]
    fn any_failing_kind_fails_a_run() {
        for kind in [
            ResultKind::Fail,
            ResultKind::Crash,
            ResultKind::Timeout,
            ResultKind::Unknown,
        ] {
            let results = set(&[("a", ResultKind::Pass), ("b", kind)]);
            assert!(!results.did_run_pass(), "{kind} should fail the run");
        }
    }

    #[test]
    fn merge_keeps_duplicates() {
        let mut results = set(&[("a", ResultKind::Fail)]);
        results.merge(set(&[("a", ResultKind::Pass)]));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn latest_attempt_is_authoritative() {
        let results = set(&[
            ("a", ResultKind::Fail),
            ("b", ResultKind::Pass),
            ("a", ResultKind::Pass),
        ]);
        let latest = results.latest_by_name();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["a"].kind(), ResultKind::Pass);
    }

    #[test]
    fn into_passing_drops_everything_else() {
        let results = set(&[
            ("a", ResultKind::Fail),
            ("b", ResultKind::Pass),
            ("c", ResultKind::Crash),
        ]);
        let passing = results.into_passing();
        assert_eq!(passing, set(&[("b", ResultKind::Pass)]));
    }

    #[test]
    fn tagging_prefixes_names() {
        let results = set(&[("a", ResultKind::Pass)]).tagged("1234");
        assert_eq!(results.all()[0].name(), "1234_a");
    }

    #[test]
    fn short_form_counts_kinds() {
        let results = set(&[
            ("a", ResultKind::Pass),
            ("b", ResultKind::Pass),
            ("c", ResultKind::Unknown),
        ]);
        assert_eq!(results.short_form(), "ALL (3 tests), PASS: 2, UNKNOWN: 1");
    }

    #[test]
    fn long_form_lists_failures() {
        let results = set(&[
            ("a", ResultKind::Pass),
            ("c", ResultKind::Fail),
            ("b", ResultKind::Fail),
        ]);
        assert_eq!(
            results.long_form(),
            "ALL (3 tests), PASS: 1, FAIL: 2\nFAIL (2):\n  b\n  c"
        );
    }

    #[test]
    fn failure_logs_only_include_failures() {
        let mut results = ResultSet::new();
        results.add_result(TestResult::new("a", ResultKind::Pass).with_log("fine"));
        results.add_result(TestResult::new("b", ResultKind::Crash).with_log("boom"));
        assert_eq!(results.failure_logs(), "[CRASH] b:\nboom\n");
    }

    #[test]
    fn serializes_as_a_list() {
        let results = set(&[("a", ResultKind::Timeout)]);
        let json = serde_json::to_string(&results).unwrap();
        assert_eq!(json, r#"[{"name":"a","kind":"TIMEOUT"}]"#);
    }
}
