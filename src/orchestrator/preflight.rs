//! QA Preflight (§4.4): runs the deterministic shell command for a QA stage,
//! captures output, classifies pass/fail.
//!
//! The subprocess execution discipline (spawn via `tokio::process::Command`,
//! join both stdio streams concurrently, hard wall-clock timeout via
//! `tokio::time::timeout`, kill-on-timeout) is carried over directly from
//! the donor's `BashTool::execute` (`tools/bash.rs`).

use crate::orchestrator::types::{CommandResult, PreflightResult};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

const PREVIEW_LIMIT: usize = 8 * 1024;
const AGGREGATE_LIMIT: usize = 20 * 1024;

/// One row of the §4.4 stage table.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub transition: &'static str,
    pub stage_label: &'static str,
    pub command: &'static str,
    pub timeout: Duration,
}

pub fn stage_for_transition(transition: &str) -> Option<StageSpec> {
    Some(match transition {
        "run-lint" => StageSpec {
            transition: "run-lint",
            stage_label: "lint",
            command: "yarn run lint",
            timeout: Duration::from_secs(5 * 60),
        },
        "run-typecheck" => StageSpec {
            transition: "run-typecheck",
            stage_label: "typecheck",
            command: "yarn run typecheck",
            timeout: Duration::from_secs(5 * 60),
        },
        "run-unit-tests" => StageSpec {
            transition: "run-unit-tests",
            stage_label: "unit-tests",
            command: "yarn run test",
            timeout: Duration::from_secs(10 * 60),
        },
        "run-e2e-tests" => StageSpec {
            transition: "run-e2e-tests",
            stage_label: "e2e-tests",
            command: "npx playwright test",
            timeout: Duration::from_secs(15 * 60),
        },
        "ensure-coverage" => StageSpec {
            transition: "ensure-coverage",
            stage_label: "coverage",
            command: "yarn run test -- --coverage",
            timeout: Duration::from_secs(15 * 60),
        },
        _ => return None,
    })
}

/// Abstraction over "run a shell command and capture its result", so tests
/// can inject a fake runner instead of spawning real processes (§A.4 of
/// SPEC_FULL.md).
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> CommandResult;
}

/// Real subprocess runner, grounded on `BashTool::execute`.
pub struct ShellCommandRunner;

fn truncate_preview(s: &str) -> String {
    if s.len() <= PREVIEW_LIMIT {
        return s.to_string();
    }
    let truncated_chars = s.len() - PREVIEW_LIMIT;
    format!("{}...[truncated {} chars]", &s[..PREVIEW_LIMIT], truncated_chars)
}

#[async_trait::async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> CommandResult {
        let shell_path = "/bin/bash";
        let cmd = command.to_string();
        let cwd = cwd.to_path_buf();

        let outcome = tokio::time::timeout(timeout, async move {
            let mut proc = TokioCommand::new(shell_path);
            proc.arg("-c")
                .arg(&cmd)
                .current_dir(&cwd)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());

            let mut child = proc.spawn().map_err(|e| e.to_string())?;
            let mut stdout_pipe = child.stdout.take().expect("stdout piped");
            let mut stderr_pipe = child.stderr.take().expect("stderr piped");

            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (stdout_res, stderr_res) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout_buf),
                stderr_pipe.read_to_end(&mut stderr_buf),
            );
            stdout_res.map_err(|e| e.to_string())?;
            stderr_res.map_err(|e| e.to_string())?;

            let status = child.wait().await.map_err(|e| e.to_string())?;
            Ok::<_, String>((status.code(), stdout_buf, stderr_buf))
        })
        .await;

        match outcome {
            Ok(Ok((exit_code, stdout_bytes, stderr_bytes))) => {
                let stdout_full = String::from_utf8_lossy(&stdout_bytes).to_string();
                let stderr_full = String::from_utf8_lossy(&stderr_bytes).to_string();
                CommandResult {
                    label: command.to_string(),
                    command: command.to_string(),
                    exit_code,
                    stdout_preview: truncate_preview(&stdout_full),
                    stderr_preview: truncate_preview(&stderr_full),
                    stdout_full,
                    stderr_full,
                    error_message: None,
                }
            }
            Ok(Err(msg)) => CommandResult {
                label: command.to_string(),
                command: command.to_string(),
                exit_code: None,
                stdout_preview: String::new(),
                stderr_preview: String::new(),
                stdout_full: String::new(),
                stderr_full: String::new(),
                error_message: Some(msg),
            },
            Err(_elapsed) => {
                CommandResult {
                    label: command.to_string(),
                    command: command.to_string(),
                    exit_code: None,
                    stdout_preview: String::new(),
                    stderr_preview: String::new(),
                    stdout_full: String::new(),
                    stderr_full: String::new(),
                    error_message: Some(format!("command exceeded {:?} timeout", timeout)),
                }
            }
        }
    }
}

fn render_aggregate(stage_label: &str, results: &[CommandResult]) -> String {
    let mut out = format!("QA preflight stage: {}\n", stage_label);
    for r in results {
        out.push_str(&format!(
            "-- {} (exit={:?})\nSTDOUT:\n{}\nSTDERR:\n{}\n",
            r.command, r.exit_code, r.stdout_preview, r.stderr_preview
        ));
    }
    if out.len() > AGGREGATE_LIMIT {
        let truncated_chars = out.len() - AGGREGATE_LIMIT;
        out.truncate(AGGREGATE_LIMIT);
        out.push_str(&format!("...[truncated {} chars]", truncated_chars));
    }
    out
}

/// Does `{workspace_root}/playwright.config.{ts,js,mjs}` exist? (§4.4 E2E
/// guard.)
pub fn has_playwright_config(workspace_root: &Path) -> bool {
    ["ts", "js", "mjs"]
        .iter()
        .any(|ext| workspace_root.join(format!("playwright.config.{}", ext)).is_file())
}

/// Run the QA Preflight stage for `transition` (§4.4). Never surfaces a raw
/// exception — any failure to even spawn a command is folded into a failed
/// [`PreflightResult`] with an empty command list.
pub async fn run_preflight(
    transition: &str,
    workspace_root: &Path,
    runner: &dyn CommandRunner,
) -> PreflightResult {
    let stage = match stage_for_transition(transition) {
        Some(s) => s,
        None => {
            return PreflightResult {
                stage: "unknown".to_string(),
                pass: false,
                command_results: vec![],
                rendered_aggregate: format!("no preflight stage defined for transition `{}`", transition),
            }
        }
    };

    if stage.transition == "run-e2e-tests" && !has_playwright_config(workspace_root) {
        return PreflightResult {
            stage: stage.stage_label.to_string(),
            pass: true,
            command_results: vec![],
            rendered_aggregate: "no playwright.config.{ts,js,mjs} found; e2e tests skipped".to_string(),
        };
    }

    let command_result = runner.run(stage.command, workspace_root, stage.timeout).await;

    let pass = command_result.ok();
    let results = vec![command_result];
    PreflightResult {
        stage: stage.stage_label.to_string(),
        pass,
        rendered_aggregate: render_aggregate(stage.stage_label, &results),
        command_results: results,
    }
}
