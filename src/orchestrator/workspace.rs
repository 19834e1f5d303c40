//! Workspace root detection and environment-driven configuration (§6).
//!
//! Deliberately minimal — no TOML/YAML parsing dependency, matching the
//! donor's `CloudLLMConfig` policy of manual construction over config-file
//! frameworks.

use std::path::{Path, PathBuf};

/// Walk upward from `start` until either
/// `packages/mcp/config/mcp-server-config.json` exists, or both `prompts/`
/// and `package.json` exist (§6).
pub fn detect_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    while let Some(d) = dir {
        let marker_a = d.join("packages/mcp/config/mcp-server-config.json");
        let marker_b_prompts = d.join("prompts");
        let marker_b_package = d.join("package.json");
        if marker_a.is_file() || (marker_b_prompts.is_dir() && marker_b_package.is_file()) {
            return Some(d);
        }
        dir = d.parent().map(|p| p.to_path_buf());
    }
    None
}

/// Resolve the starting directory for workspace detection: `INIT_CWD` if
/// set, else `CWD`, else the process's actual current directory (§6).
pub fn starting_dir() -> PathBuf {
    std::env::var("INIT_CWD")
        .ok()
        .or_else(|| std::env::var("CWD").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Orchestrator-wide configuration, constructed directly by the embedding
/// binary — no config-file parser. Environment variables named in §6 can
/// populate it via [`OrchestratorConfig::from_env`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_root: PathBuf,
    pub db_path: PathBuf,
    pub poll_interval_ms: u64,
    pub claim_mode: bool,
    pub worker_count: u32,
    pub fallback_model: Option<String>,
    pub mcp_endpoint: Option<String>,
    pub test_mode: bool,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let workspace_root = detect_workspace_root(&starting_dir()).unwrap_or_else(starting_dir);
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("db"));
        let fallback_model = std::env::var("ACP_MODEL")
            .or_else(|_| std::env::var("OPENAI_MODEL"))
            .or_else(|_| std::env::var("MODEL"))
            .or_else(|_| std::env::var("LLM_MODEL"))
            .ok();
        let mcp_endpoint = isomorphiq_or_mcp_env("HOST")
            .or_else(|| isomorphiq_or_mcp_env("PORT"))
            .or_else(|| isomorphiq_or_mcp_env("PATH"))
            .or_else(|| isomorphiq_or_mcp_env("URL"));
        let test_mode = env_truthy("ISOMORPHIQ_TEST_MODE") || std::env::var("NODE_ENV").map(|v| v == "test").unwrap_or(false);

        OrchestratorConfig {
            workspace_root,
            db_path,
            poll_interval_ms: 10_000,
            claim_mode: false,
            worker_count: 1,
            fallback_model,
            mcp_endpoint,
            test_mode,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            workspace_root: PathBuf::from("."),
            db_path: PathBuf::from("./db"),
            poll_interval_ms: 10_000,
            claim_mode: false,
            worker_count: 1,
            fallback_model: None,
            mcp_endpoint: None,
            test_mode: false,
        }
    }
}

fn isomorphiq_or_mcp_env(suffix: &str) -> Option<String> {
    std::env::var(format!("ISOMORPHIQ_MCP_{}", suffix))
        .or_else(|_| std::env::var(format!("MCP_{}", suffix)))
        .ok()
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}
