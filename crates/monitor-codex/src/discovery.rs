//! Locating the codex executable across the usual install layouts.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use crate::error::RpcError;

pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

fn common_bin_dirs() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |path: PathBuf| {
        if seen.insert(path.clone()) {
            dirs_out.push(path);
        }
    };

    if let Ok(home_override) = env::var("CODEX_HOME") {
        let trimmed = home_override.trim();
        if !trimmed.is_empty() {
            let root = PathBuf::from(trimmed);
            push(root.join("bin"));
            push(root);
        }
    }

    if let Some(home) = dirs::home_dir() {
        push(home.join(".codex/bin"));
        push(home.join(".codex"));
        push(home.join(".npm-global/bin"));
        push(home.join(".local/bin"));
        push(home.join(".cargo/bin"));
        push(home.join("node_modules/.bin"));
    }

    for path in ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"] {
        push(PathBuf::from(path));
    }

    dirs_out
}

fn find_in_common_bins(binary: &str) -> Option<PathBuf> {
    common_bin_dirs()
        .into_iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn app_server_override() -> Option<PathBuf> {
    let value = env::var("CODEX_APP_SERVER").ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(trimmed);
    candidate.is_file().then_some(candidate)
}

fn codex_bin_override() -> Option<PathBuf> {
    let value = env::var("CODEX_BIN").ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(trimmed);
    if candidate.is_file() {
        return Some(candidate);
    }
    which::which(trimmed).ok()
}

/// Resolve the command used to start the RPC backend.
///
/// Preference order: an explicit `CODEX_APP_SERVER` override, a
/// `codex-app-server` on the PATH or in common bin dirs, then a `codex`
/// binary invoked with the `app-server` subcommand.
pub fn resolve_backend_command() -> Result<BackendCommand, RpcError> {
    if let Some(program) = app_server_override() {
        return Ok(BackendCommand {
            program,
            args: Vec::new(),
        });
    }

    if let Ok(program) = which::which("codex-app-server") {
        return Ok(BackendCommand {
            program,
            args: Vec::new(),
        });
    }
    if let Some(program) = find_in_common_bins("codex-app-server") {
        return Ok(BackendCommand {
            program,
            args: Vec::new(),
        });
    }

    let program = codex_bin_override()
        .or_else(|| which::which("codex").ok())
        .or_else(|| find_in_common_bins("codex"))
        .ok_or(RpcError::ExecutableNotFound)?;

    Ok(BackendCommand {
        program,
        args: vec!["app-server".to_string()],
    })
}

/// Whether a codex backend appears to be installed at all.
pub fn is_codex_available() -> bool {
    resolve_backend_command().is_ok()
}
