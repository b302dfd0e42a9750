//! Regression assertions: generated from observed values, then minimised by
//! the lines their slices check.

use crate::execution::TestCaseExecutor;
use crate::testcase::{Primitive, StatementKind, TestCase};
use std::collections::BTreeSet;

/// Assert the observed value of every call statement that ran before the
/// first exception. Floats are skipped, so are statements whose assertion
/// does not hold on a second run. Returns the number of assertions added.
pub fn generate_assertions(executor: &dyn TestCaseExecutor, tests: &mut [TestCase]) -> usize {
    let mut added = 0;
    for test in tests.iter_mut() {
        test.clear_assertions();
        let result = executor.execute(test);
        if result.timeout {
            continue;
        }
        let end = result.first_exception().unwrap_or(test.len());
        let mut asserted = Vec::new();
        for (index, statement) in test.statements.iter_mut().enumerate().take(end) {
            if matches!(statement.kind, StatementKind::Primitive(_)) {
                continue;
            }
            match result.values.get(&index) {
                Some(Primitive::Float(_)) | None => {}
                Some(value) => {
                    statement.assertions.push(value.clone());
                    asserted.push(index);
                }
            }
        }
        if asserted.is_empty() {
            continue;
        }

        let check = executor.execute(test);
        for (index, exception) in &check.exceptions {
            if exception.kind == "AssertionError" && asserted.contains(index) {
                tracing::debug!("Dropping flaky assertion on statement {}", index);
                test.statements[*index].assertions.clear();
                asserted.retain(|i| i != index);
            }
        }
        added += asserted.len();
    }
    tracing::info!("Generated {} assertions", added);
    added
}

/// Keep an assertion only when its slice checks a line no earlier kept
/// assertion of the suite checks. Assertions without a slice are kept.
/// Returns the number of assertions removed.
pub fn minimize_assertions(executor: &dyn TestCaseExecutor, tests: &mut [TestCase]) -> usize {
    let mut checked = BTreeSet::new();
    let mut removed = 0;
    for test in tests.iter_mut() {
        if test.assertion_count() == 0 {
            continue;
        }
        let result = executor.execute(test);
        let mut redundant: Vec<(usize, usize)> = Vec::new();
        for lines in &result.assertion_lines {
            if lines.lines.is_subset(&checked) {
                redundant.push((lines.statement, lines.assertion));
            } else {
                checked.extend(lines.lines.iter().copied());
            }
        }
        // Highest assertion index first so earlier indices stay valid.
        redundant.sort_unstable_by(|a, b| b.cmp(a));
        for (statement, assertion) in redundant {
            if let Some(assertions) = test.statements.get_mut(statement).map(|s| &mut s.assertions) {
                if assertion < assertions.len() {
                    assertions.remove(assertion);
                    removed += 1;
                }
            }
        }
    }
    tracing::info!("Removed {} assertions that check no new lines", removed);
    removed
}
