//! Runtime adjustments for configuration defaults.
//!
//! Resolves transport binaries and environment-provided values.

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::util::program_in_path;

use super::InstallerConfig;

const BOOTSTRAP_ID_ENV: &str = "BOOTSTRAP_ID";

impl InstallerConfig {
    pub(super) fn apply_runtime_defaults(&mut self) {
        resolve_binary(&mut self.ssh_binary_path, "ssh");
        resolve_binary(&mut self.scp_binary_path, "scp");
        if self.bootstrap_id.is_none() {
            self.bootstrap_id = bootstrap_id_from(env::var(BOOTSTRAP_ID_ENV).ok());
        }
    }
}

fn resolve_binary(configured: &mut PathBuf, program: &str) {
    if binary_available(configured) {
        return;
    }
    // Fall back to whatever the PATH provides when the configured location is absent.
    if program_in_path(program) {
        debug!(
            configured = %configured.display(),
            program,
            "configured binary missing; using PATH lookup"
        );
        *configured = PathBuf::from(program);
    }
}

fn binary_available(path: &Path) -> bool {
    program_in_path(&path.to_string_lossy())
}

fn bootstrap_id_from(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_id_ignores_blank_values() {
        assert_eq!(bootstrap_id_from(None), None);
        assert_eq!(bootstrap_id_from(Some("  ".to_string())), None);
        assert_eq!(
            bootstrap_id_from(Some(" 5b4669c8 ".to_string())),
            Some("5b4669c8".to_string())
        );
    }
}
