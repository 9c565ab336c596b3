//! Path utilities and XDG directory discovery

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// XDG-compliant paths for Lodestone
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    /// Create a new Paths instance with XDG discovery
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "Lodestone", "lodestone"),
        }
    }

    /// Get user config directory (~/.config/lodestone/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("Failed to determine user config directory".to_string())
            })
    }

    /// Get user config file path (~/.config/lodestone/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Get project config file path (lodestone.toml)
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("lodestone.toml")
    }

    /// Get local config file path (lodestone.local.toml, gitignored)
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("lodestone.local.toml")
    }

    /// Check if a project is initialized (has lodestone.toml)
    pub fn is_initialized(project_dir: impl AsRef<Path>) -> bool {
        Self::project_config_file(project_dir).exists()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn project_paths_join_the_project_dir() {
        let dir = tempdir().expect("Failed to create temp dir");
        let project = Paths::project_config_file(dir.path());
        assert_eq!(project, dir.path().join("lodestone.toml"));

        let local = Paths::local_config_file(dir.path());
        assert_eq!(local, dir.path().join("lodestone.local.toml"));
    }

    #[test]
    fn uninitialized_project_is_detected() {
        let dir = tempdir().expect("Failed to create temp dir");
        assert!(!Paths::is_initialized(dir.path()));

        std::fs::write(dir.path().join("lodestone.toml"), "[proposer]\n")
            .expect("Failed to write config");
        assert!(Paths::is_initialized(dir.path()));
    }
}
