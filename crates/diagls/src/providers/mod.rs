//
// providers/mod.rs
//
// Analyzer and formatter contract, plus the registry of built-in tools
//

pub mod php_cs_fixer;
pub mod php_lint;
pub mod phpstan;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tower_lsp::lsp_types::Diagnostic;

use crate::config::{ProjectConfig, ProviderConfig};
use crate::context::RequestContext;
use crate::diff::DiffError;
use crate::gateway::{CommandError, CommandResult, CommandRunner};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("exited with code {}: {stderr}", .code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    UnexpectedExit { code: Option<i32>, stderr: String },
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("failed to apply formatting diff: {0}")]
    Diff(#[from] DiffError),
    #[error("formatting is not enabled for {0}")]
    FormattingDisabled(String),
}

impl ProviderError {
    /// Cancellation and deadline expiry are not failures worth reporting.
    pub fn is_cancellation(&self) -> bool {
        match self {
            ProviderError::Cancelled => true,
            ProviderError::Command(e) => e.is_cancellation(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait DiagnosticsProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    async fn analyze(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> Result<Vec<Diagnostic>, ProviderError>;
}

#[async_trait]
pub trait FormattingProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Return the formatted text for `content`, the current body of `path`.
    async fn format(
        &self,
        ctx: &RequestContext,
        path: &Path,
        content: &str,
    ) -> Result<String, ProviderError>;
}

/// Everything a provider needs to run its tool.
#[derive(Clone)]
pub struct ProviderSetup {
    pub root: PathBuf,
    pub config: ProviderConfig,
    pub runner: Arc<dyn CommandRunner>,
}

impl ProviderSetup {
    /// Path of `path` as seen from the container's working directory,
    /// which is expected to be the project root.
    pub fn relative_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        shell_quote(&relative.to_string_lossy())
    }

    pub async fn run(
        &self,
        ctx: &RequestContext,
        command: &str,
        stdin: Option<&str>,
    ) -> CommandResult {
        self.runner
            .run(ctx, &self.config.container, command, stdin)
            .await
    }
}

/// Quote `arg` for `sh -c` unless it is made of characters that never need it.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | '='));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// A constructed provider. Tools that can also format expose the same
/// instance through `formatter`.
pub struct BuiltProvider {
    pub diagnostics: Arc<dyn DiagnosticsProvider>,
    pub formatter: Option<Arc<dyn FormattingProvider>>,
}

pub type ProviderConstructor = fn(ProviderSetup) -> BuiltProvider;

#[derive(Default)]
pub struct LoadedProviders {
    pub diagnostics: Vec<Arc<dyn DiagnosticsProvider>>,
    pub formatters: Vec<Arc<dyn FormattingProvider>>,
    /// One message per provider that could not be loaded
    pub errors: Vec<String>,
}

/// Maps configuration identifiers to provider constructors.
#[derive(Default)]
pub struct ProviderRegistry {
    constructors: BTreeMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(phpstan::ID, phpstan::build);
        registry.register(php_lint::ID, php_lint::build);
        registry.register(php_cs_fixer::ID, php_cs_fixer::build);
        registry
    }

    pub fn register(&mut self, id: &str, constructor: ProviderConstructor) {
        self.constructors.insert(id.to_string(), constructor);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build every enabled provider in `config`.
    ///
    /// Each provider's container and binary are checked once here. A
    /// provider that fails the check, or whose identifier is unknown, is
    /// skipped and described in [`LoadedProviders::errors`].
    pub async fn load(
        &self,
        config: &ProjectConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> LoadedProviders {
        let mut loaded = LoadedProviders::default();

        for (id, provider_config) in config.enabled_providers() {
            let Some(constructor) = self.constructors.get(id) else {
                loaded
                    .errors
                    .push(format!("unknown diagnostics provider: {id}"));
                continue;
            };

            if let Err(e) = validate(runner.as_ref(), provider_config).await {
                log::warn!("Skipping provider {id}: {e:#}");
                loaded
                    .errors
                    .push(format!("failed to initialize {id}; error: {e:#}"));
                continue;
            }

            let built = constructor(ProviderSetup {
                root: config.root.clone(),
                config: provider_config.clone(),
                runner: runner.clone(),
            });
            log::info!(
                "Loaded provider {} (container {}, formatting {})",
                built.diagnostics.name(),
                provider_config.container,
                built.formatter.is_some()
            );
            loaded.diagnostics.push(built.diagnostics);
            loaded.formatters.extend(built.formatter);
        }

        loaded
    }
}

async fn validate(runner: &dyn CommandRunner, config: &ProviderConfig) -> anyhow::Result<()> {
    runner.validate_target(&config.container).await?;
    runner.validate_binary(&config.container, &config.path).await
}
