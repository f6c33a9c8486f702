//! Helper scripts embedded in the binary.
//!
//! The Modal adapter drives vendor tooling through a Python helper. The
//! script ships inside the binary and is extracted on demand to a cache
//! directory; connector commands reference it as `@modal_sandbox.py`.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use include_dir::{include_dir, Dir};
use regex::Regex;

static SCRIPTS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/scripts");

static SCRIPTS_CACHE: OnceLock<Result<PathBuf, ScriptError>> = OnceLock::new();

/// Matches `@filename.ext` at the start of a word.
static SCRIPT_PATTERN: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to prepare script cache: {0}")]
    Cache(String),

    #[error("script not bundled: {0}")]
    NotBundled(String),
}

fn cache_dir() -> Result<PathBuf, ScriptError> {
    let base = if cfg!(target_os = "macos") {
        env::var("HOME").ok().map(|h| PathBuf::from(h).join("Library/Caches"))
    } else {
        env::var("XDG_CACHE_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| env::var("HOME").ok().map(|h| PathBuf::from(h).join(".cache")))
    };
    let dir = base
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("crucible")
        .join("scripts");
    fs::create_dir_all(&dir).map_err(|e| ScriptError::Cache(e.to_string()))?;
    Ok(dir)
}

fn ensure_extracted() -> Result<PathBuf, ScriptError> {
    SCRIPTS_CACHE
        .get_or_init(|| {
            let dir = cache_dir()?;
            for file in SCRIPTS_DIR.files() {
                let target = dir.join(file.path());
                if let Ok(existing) = fs::read(&target) {
                    if existing == file.contents() {
                        continue;
                    }
                }
                fs::write(&target, file.contents())
                    .map_err(|e| ScriptError::Cache(format!("{}: {e}", file.path().display())))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = fs::set_permissions(&target, fs::Permissions::from_mode(0o755));
                }
            }
            Ok(dir)
        })
        .clone()
}

fn pattern() -> &'static Regex {
    SCRIPT_PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|\s)@([\w\-]+\.\w+)").unwrap()
    })
}

/// Expand `@script.ext` references in a command string to their extracted
/// paths, unpacking the bundle on first use.
pub fn expand_command(command: &str) -> Result<String, ScriptError> {
    if !pattern().is_match(command) {
        return Ok(command.to_string());
    }
    let dir = ensure_extracted()?;
    let mut expanded = command.to_string();
    for cap in pattern().captures_iter(command) {
        let name = &cap[1];
        if SCRIPTS_DIR.get_file(name).is_none() {
            return Err(ScriptError::NotBundled(name.to_string()));
        }
        expanded = expanded.replace(
            &format!("@{name}"),
            &dir.join(name).display().to_string(),
        );
    }
    Ok(expanded)
}
