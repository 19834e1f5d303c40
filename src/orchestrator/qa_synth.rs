//! Procedural QA Synthesizer (§4.5): turns a preflight result into a
//! synthetic execution result, a context patch, and a report — no LLM call.

use crate::orchestrator::types::{CommandResult, ExecutionResult, PreflightResult, ProceduralQaReport, TestReport, TestStatus};
use serde_json::{json, Value as JsonValue};

const NOTES_LIMIT: usize = 8 * 1024;
const MAX_FAILED_TESTS: usize = 24;

fn bounded(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let dropped = s.len() - limit;
        format!("{}...[truncated {} chars]", &s[..limit], dropped)
    }
}

/// Extract `"{label}: {command}" [+ "(exitCode=N)" or error]` for each
/// failed command (§4.5).
fn failed_test_entry(r: &CommandResult) -> String {
    let mut entry = format!("{}: {}", r.label, r.command);
    if let Some(err) = &r.error_message {
        entry.push_str(&format!(" ({})", err));
    } else if let Some(code) = r.exit_code {
        entry.push_str(&format!(" (exitCode={})", code));
    }
    entry
}

/// Parse Playwright-style failure lines out of combined stdout/stderr: lines
/// matching `^\d+\)\s+`, `^fail(ed)?\b` (case-insensitive), and bracketed
/// arrow lines like `  1) [chromium] › checkout.spec.ts:12:3 › ...` (§4.5).
fn parse_playwright_failure_lines(output: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let is_numbered = line
            .split_once(')')
            .map(|(prefix, rest)| !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) && rest.starts_with(' '))
            .unwrap_or(false);
        let lower = line.to_ascii_lowercase();
        let is_fail_word = lower.starts_with("fail") && (lower.len() == 4 || !lower.as_bytes()[4].is_ascii_alphanumeric());
        let is_bracketed_arrow = line.starts_with('[') && line.contains("\u{203a}");
        if is_numbered || is_fail_word || is_bracketed_arrow {
            lines.push(line.to_string());
        }
    }
    lines
}

fn build_test_report(transition: &str, preflight: &PreflightResult) -> TestReport {
    let mut failed_tests: Vec<String> = Vec::new();
    for r in &preflight.command_results {
        if !r.ok() {
            failed_tests.push(failed_test_entry(r));
        }
    }

    if transition == "run-e2e-tests" {
        for r in &preflight.command_results {
            let combined = format!("{}\n{}", r.stdout_full, r.stderr_full);
            for line in parse_playwright_failure_lines(&combined) {
                if !failed_tests.contains(&line) {
                    failed_tests.push(line);
                }
            }
        }
    }
    failed_tests.truncate(MAX_FAILED_TESTS);

    let mut repro_steps: Vec<String> = Vec::new();
    for r in &preflight.command_results {
        if !repro_steps.contains(&r.command) {
            repro_steps.push(r.command.clone());
        }
    }

    let suspected_root_cause = preflight
        .command_results
        .iter()
        .find(|r| !r.ok())
        .map(failed_test_entry)
        .unwrap_or_else(|| format!("{} completed without errors", preflight.stage));

    TestReport {
        failed_tests,
        repro_steps,
        suspected_root_cause,
        notes: bounded(&preflight.rendered_aggregate, NOTES_LIMIT),
    }
}

/// Synthesize `{execution_result, context_patch, report}` from a preflight
/// result (§4.5). No LLM call is ever made here.
pub fn synthesize(transition: &str, preflight: &PreflightResult) -> (ExecutionResult, JsonValue, ProceduralQaReport) {
    let status = if preflight.pass { TestStatus::Passed } else { TestStatus::Failed };
    let test_report = build_test_report(transition, preflight);

    let summary = if preflight.pass {
        format!("{} passed", preflight.stage)
    } else {
        format!("{} failed", preflight.stage)
    };

    let execution_result = ExecutionResult {
        success: preflight.pass,
        output: preflight.rendered_aggregate.clone(),
        error: if preflight.pass { None } else { Some(test_report.notes.clone()) },
        summary: Some(summary.clone()),
    };

    let mut patch = json!({
        "testStatus": if preflight.pass { "passed" } else { "failed" },
        "testReport": test_report,
        "mechanicalQaPreflightResults": preflight,
        "mechanicalTestLintResults": preflight,
        "mechanicalQaPreflightStage": preflight.stage,
    });

    let mut coverage_sub_report = None;
    if transition == "run-e2e-tests" {
        let status_str = if preflight.pass { "PASSED" } else { "FAILED" };
        let e2e_results = json!({
            "status": status_str,
            "failedTests": test_report.failed_tests,
            "reproSteps": test_report.repro_steps,
            "suspectedRootCause": test_report.suspected_root_cause,
            "notes": test_report.notes,
            "commandResults": preflight.command_results,
        });
        let obj = patch.as_object_mut().unwrap();
        obj.insert("e2eTestResultStatus".to_string(), json!(status_str));
        obj.insert("e2e-test-result-status".to_string(), json!(status_str));
        obj.insert("e2eTestResults".to_string(), e2e_results.clone());
        obj.insert("e2e-test-results".to_string(), e2e_results);
    }

    if transition == "ensure-coverage" {
        let cov = json!({ "commandResults": preflight.command_results });
        patch.as_object_mut().unwrap().insert("coverageReport".to_string(), cov.clone());
        coverage_sub_report = Some(cov);
    }

    let report = ProceduralQaReport {
        transition: transition.to_string(),
        stage_label: preflight.stage.clone(),
        status,
        summary,
        full_output: preflight.rendered_aggregate.clone(),
        test_report,
        command_results: preflight.command_results.clone(),
        coverage_sub_report,
    };

    (execution_result, patch, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::CommandResult;

    fn passing_preflight(stage: &str, command: &str) -> PreflightResult {
        PreflightResult {
            stage: stage.to_string(),
            pass: true,
            command_results: vec![CommandResult {
                label: stage.to_string(),
                command: command.to_string(),
                exit_code: Some(0),
                stdout_preview: "ok".to_string(),
                stderr_preview: String::new(),
                stdout_full: "ok".to_string(),
                stderr_full: String::new(),
                error_message: None,
            }],
            rendered_aggregate: "aggregate ok".to_string(),
        }
    }

    fn failing_e2e_preflight() -> PreflightResult {
        let stdout = "Running 3 tests\n1) [chromium] \u{203a} tests/checkout.spec.ts:12:3 \u{203a} user can pay\n2 passed, 1 failed";
        PreflightResult {
            stage: "e2e-tests".to_string(),
            pass: false,
            command_results: vec![CommandResult {
                label: "e2e-tests".to_string(),
                command: "npx playwright test".to_string(),
                exit_code: Some(1),
                stdout_preview: stdout.to_string(),
                stderr_preview: String::new(),
                stdout_full: stdout.to_string(),
                stderr_full: String::new(),
                error_message: None,
            }],
            rendered_aggregate: "aggregate fail".to_string(),
        }
    }

    #[test]
    fn scenario_run_lint_pass_produces_empty_failed_tests() {
        let preflight = passing_preflight("lint", "yarn run lint");
        let (exec, patch, report) = synthesize("run-lint", &preflight);
        assert!(exec.success);
        assert_eq!(patch["testStatus"], "passed");
        assert!(report.test_report.failed_tests.is_empty());
        assert_eq!(report.test_report.repro_steps, vec!["yarn run lint".to_string()]);
    }

    #[test]
    fn e2e_failure_extracts_playwright_line_and_sets_aliases() {
        let preflight = failing_e2e_preflight();
        let (exec, patch, report) = synthesize("run-e2e-tests", &preflight);
        assert!(!exec.success);
        assert_eq!(patch["e2eTestResultStatus"], "FAILED");
        assert_eq!(patch["e2e-test-result-status"], "FAILED");
        assert!(report
            .test_report
            .failed_tests
            .iter()
            .any(|l| l.contains("checkout.spec.ts:12:3")));
    }

    #[test]
    fn coverage_transition_includes_sub_report() {
        let preflight = passing_preflight("coverage", "yarn run test -- --coverage");
        let (_, patch, report) = synthesize("ensure-coverage", &preflight);
        assert!(patch.get("coverageReport").is_some());
        assert!(report.coverage_sub_report.is_some());
    }

    #[test]
    fn failed_preflight_produces_nonempty_failed_tests() {
        let mut preflight = passing_preflight("unit-tests", "yarn run test");
        preflight.pass = false;
        preflight.command_results[0].exit_code = Some(1);
        let (_, _, report) = synthesize("run-unit-tests", &preflight);
        assert!(!report.test_report.failed_tests.is_empty());
    }
}
