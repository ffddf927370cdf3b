//! Temporary PHP projects for tests.
//!
//! A fixture is a directory holding a `.diagls.json` and whatever source
//! files a test writes into it. It is removed when dropped.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tower_lsp::lsp_types::Url;

use crate::config::CONFIG_FILE_NAME;

/// All three built-in providers, enabled, in container `app`.
/// PHP-CS-Fixer also formats.
pub const ALL_PROVIDERS_CONFIG: &str = r#"{
    "diagnosticsProviders": {
        "phpstan": { "enabled": true, "container": "app", "path": "vendor/bin/phpstan" },
        "phplint": { "enabled": true, "container": "app", "path": "php" },
        "phpcsfixer": {
            "enabled": true, "container": "app", "path": "vendor/bin/php-cs-fixer",
            "format": { "enabled": true, "timeoutSeconds": 5 }
        }
    }
}"#;

pub struct ProjectFixture {
    dir: TempDir,
}

impl ProjectFixture {
    /// Create a project whose `.diagls.json` holds `config`.
    pub fn new(config: &str) -> Self {
        let fixture = Self::without_config();
        std::fs::write(fixture.root().join(CONFIG_FILE_NAME), config)
            .expect("Failed to write fixture config");
        fixture
    }

    /// Create an empty project with no configuration file.
    pub fn without_config() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory for fixture project");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn root_uri(&self) -> Url {
        Url::from_directory_path(self.root()).expect("Fixture root is absolute")
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn uri(&self, relative: &str) -> Url {
        Url::from_file_path(self.path(relative)).expect("Fixture path is absolute")
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create fixture directories");
        }
        std::fs::write(&path, contents)
            .unwrap_or_else(|e| panic!("Failed to write fixture file {}: {}", relative, e));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;

    #[test]
    fn test_fixture_config_loads() {
        let fixture = ProjectFixture::new(ALL_PROVIDERS_CONFIG);
        let config = ProjectConfig::load(fixture.root()).unwrap();
        assert_eq!(config.enabled_providers().count(), 3);
    }

    #[test]
    fn test_write_creates_directories() {
        let fixture = ProjectFixture::without_config();
        let path = fixture.write("src/Domain/User.php", "<?php\n");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "<?php\n");
        assert!(fixture.uri("src/Domain/User.php").as_str().ends_with("src/Domain/User.php"));
    }
}
