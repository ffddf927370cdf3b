//
// config.rs
//
// Project configuration file and server settings
//

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = ".diagls.json";

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_ignored_paths() -> Vec<String> {
    vec!["vendor/".to_string(), "var/cache/".to_string()]
}

fn default_file_extensions() -> Vec<String> {
    vec!["php".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl FormatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// One entry of `diagnosticsProviders`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Container the tool runs in
    pub container: String,
    /// Tool binary, resolved inside the container
    pub path: String,
    /// Tool-specific configuration file, relative to the project root
    #[serde(default)]
    pub config_file: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub format: FormatConfig,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn config_file(&self) -> Option<&str> {
        self.config_file.as_deref().filter(|file| !file.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProjectConfig {
    #[serde(default)]
    diagnostics_providers: BTreeMap<String, ProviderConfig>,
    #[serde(default = "default_ignored_paths")]
    ignored_paths: Vec<String>,
    #[serde(default = "default_file_extensions")]
    file_extensions: Vec<String>,
}

/// Contents of `.diagls.json` for one project.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub root: PathBuf,
    /// The file exactly as read, for display
    pub raw: String,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub ignored_paths: Vec<String>,
    pub file_extensions: Vec<String>,
}

impl ProjectConfig {
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE_NAME);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path));
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::parse(root, raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(root: &Path, raw: String) -> Result<Self, serde_json::Error> {
        let parsed: RawProjectConfig = serde_json::from_str(&raw)?;
        Ok(Self {
            root: root.to_path_buf(),
            raw,
            providers: parsed.diagnostics_providers,
            ignored_paths: parsed.ignored_paths,
            file_extensions: parsed.file_extensions,
        })
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = (&str, &ProviderConfig)> {
        self.providers
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(id, config)| (id.as_str(), config))
    }

    /// Whether files with this path's extension are analyzed.
    pub fn is_watched(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        self.file_extensions
            .iter()
            .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Settings the client can tune through `initializationOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub diagnostics_debounce: Duration,
    pub formatting_debounce: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            diagnostics_debounce: Duration::from_millis(300),
            formatting_debounce: Duration::from_millis(100),
        }
    }
}

impl ServerSettings {
    pub fn from_initialization_options(options: Option<&serde_json::Value>) -> Self {
        let mut settings = Self::default();
        let Some(options) = options else {
            return settings;
        };

        if let Some(v) = options.get("diagnosticsDebounceMs").and_then(|v| v.as_u64()) {
            settings.diagnostics_debounce = Duration::from_millis(v);
        }
        if let Some(v) = options.get("formattingDebounceMs").and_then(|v| v.as_u64()) {
            settings.formatting_debounce = Duration::from_millis(v);
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "diagnosticsProviders": {
            "phpstan": { "enabled": true, "container": "app", "path": "vendor/bin/phpstan", "configFile": "phpstan.neon" },
            "phpcsfixer": {
                "enabled": true, "container": "app", "path": "vendor/bin/php-cs-fixer",
                "format": { "enabled": true, "timeoutSeconds": 10 }
            },
            "phplint": { "enabled": false, "container": "app", "path": "php" }
        },
        "editor": "kept in raw"
    }"#;

    #[test]
    fn test_load_reads_providers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();

        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(config.providers.len(), 3);

        let phpstan = &config.providers["phpstan"];
        assert_eq!(phpstan.container, "app");
        assert_eq!(phpstan.config_file(), Some("phpstan.neon"));
        assert_eq!(phpstan.timeout(), Duration::from_secs(30));
        assert!(!phpstan.format.enabled);

        let fixer = &config.providers["phpcsfixer"];
        assert!(fixer.format.enabled);
        assert_eq!(fixer.format.timeout(), Duration::from_secs(10));
        assert!(config.raw.contains("kept in raw"));
    }

    #[test]
    fn test_enabled_providers_are_ordered_by_id() {
        let config = ProjectConfig::parse(Path::new("/project"), SAMPLE.to_string()).unwrap();
        let ids: Vec<&str> = config.enabled_providers().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["phpcsfixer", "phpstan"]);
    }

    #[test]
    fn test_defaults_for_optional_sections() {
        let config = ProjectConfig::parse(Path::new("/project"), "{}".to_string()).unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.ignored_paths, vec!["vendor/", "var/cache/"]);
        assert_eq!(config.file_extensions, vec!["php"]);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{ not json").unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_provider_requires_container_and_path() {
        let raw = r#"{ "diagnosticsProviders": { "phpstan": { "enabled": true } } }"#;
        assert!(ProjectConfig::parse(Path::new("/p"), raw.to_string()).is_err());
    }

    #[test]
    fn test_is_watched_matches_extension() {
        let config = ProjectConfig::parse(
            Path::new("/p"),
            r#"{ "fileExtensions": ["php", ".phtml"] }"#.to_string(),
        )
        .unwrap();
        assert!(config.is_watched(Path::new("/p/src/Foo.php")));
        assert!(config.is_watched(Path::new("/p/templates/a.PHTML")));
        assert!(!config.is_watched(Path::new("/p/README.md")));
        assert!(!config.is_watched(Path::new("/p/Makefile")));
    }

    #[test]
    fn test_server_settings_defaults() {
        let settings = ServerSettings::from_initialization_options(None);
        assert_eq!(settings.diagnostics_debounce, Duration::from_millis(300));
        assert_eq!(settings.formatting_debounce, Duration::from_millis(100));
    }

    #[test]
    fn test_server_settings_overrides() {
        let options = json!({ "diagnosticsDebounceMs": 50, "unrelated": true });
        let settings = ServerSettings::from_initialization_options(Some(&options));
        assert_eq!(settings.diagnostics_debounce, Duration::from_millis(50));
        assert_eq!(settings.formatting_debounce, Duration::from_millis(100));
    }
}
