//! Tool discovery on `PATH`

use rollguard_core::ToolInventory;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::Path;

/// Tools found on `PATH`, probed once at construction
#[derive(Debug, Clone, Default)]
pub struct PathTools {
    found: BTreeSet<String>,
}

impl PathTools {
    /// Probe the process `PATH` for `tools`
    #[must_use]
    pub fn probe(tools: &[&str]) -> Self {
        Self::probe_in(std::env::var_os("PATH"), tools)
    }

    /// Probe an explicit search path
    #[must_use]
    pub fn probe_in(path: Option<OsString>, tools: &[&str]) -> Self {
        let dirs: Vec<_> = path.as_deref().map(std::env::split_paths).into_iter().flatten().collect();
        let found = tools
            .iter()
            .filter(|tool| dirs.iter().any(|dir| is_executable(&dir.join(tool))))
            .map(|tool| (*tool).to_string())
            .collect();
        Self { found }
    }
}

impl ToolInventory for PathTools {
    fn has(&self, tool: &str) -> bool {
        self.found.contains(tool)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn finds_only_executables() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let kubectl = dir.path().join("kubectl");
        std::fs::write(&kubectl, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&kubectl, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("git"), "not executable").unwrap();

        let tools = PathTools::probe_in(Some(dir.path().as_os_str().to_owned()), &["kubectl", "git", "argocd"]);

        assert!(tools.has("kubectl"));
        assert!(!tools.has("git"));
        assert!(!tools.has("argocd"));
    }

    #[test]
    fn empty_path_finds_nothing() {
        assert!(!PathTools::probe_in(None, &["kubectl"]).has("kubectl"));
    }
}
