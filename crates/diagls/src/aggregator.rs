//
// aggregator.rs
//
// Runs every diagnostics provider on a file concurrently and merges the results
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tower_lsp::lsp_types::Diagnostic;

use crate::context::RequestContext;
use crate::providers::{DiagnosticsProvider, ProviderError};

/// A provider that did not produce results.
#[derive(Debug)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

impl ProviderFailure {
    pub fn message(&self) -> String {
        format!("Diagnostics provider {} failed: {}", self.provider, self.error)
    }
}

#[derive(Debug, Default)]
pub struct Aggregate {
    pub diagnostics: Vec<Diagnostic>,
    pub failures: Vec<ProviderFailure>,
}

/// Decides which files are skipped. A prefix matches the start of the path
/// relative to the project root, and a `/<prefix>` segment matches anywhere
/// in the path, inside the root or not.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    root: PathBuf,
    prefixes: Vec<String>,
}

impl IgnoreRules {
    pub fn new(root: impl Into<PathBuf>, prefixes: &[String]) -> Self {
        let prefixes = prefixes
            .iter()
            .map(|prefix| prefix.trim_start_matches('/').to_string())
            .filter(|prefix| !prefix.is_empty())
            .collect();
        Self {
            root: root.into(),
            prefixes,
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let (relative, inside_root) = match path.strip_prefix(&self.root) {
            Ok(relative) => (relative, true),
            Err(_) => (path, false),
        };
        let relative = relative.to_string_lossy().replace('\\', "/");

        self.prefixes.iter().any(|prefix| {
            if inside_root && relative.starts_with(prefix.as_str()) {
                return true;
            }
            relative.contains(&format!("/{prefix}"))
        })
    }
}

pub struct DiagnosticAggregator {
    providers: Vec<Arc<dyn DiagnosticsProvider>>,
    ignore: IgnoreRules,
}

impl DiagnosticAggregator {
    pub fn new(providers: Vec<Arc<dyn DiagnosticsProvider>>, ignore: IgnoreRules) -> Self {
        Self { providers, ignore }
    }

    pub fn providers(&self) -> &[Arc<dyn DiagnosticsProvider>] {
        &self.providers
    }

    /// Analyze `path` with every provider and wait for all of them.
    ///
    /// A failing or panicking provider is listed in
    /// [`Aggregate::failures`] and the others still contribute. Failures
    /// caused by cancellation are dropped silently. Each provider's own
    /// ordering is kept; the order across providers is unspecified.
    pub async fn collect(&self, ctx: &RequestContext, path: &Path) -> Aggregate {
        let mut aggregate = Aggregate::default();
        if self.ignore.is_ignored(path) {
            log::trace!("Skipping ignored path {}", path.display());
            return aggregate;
        }

        let mut tasks = JoinSet::new();
        let mut names = Vec::with_capacity(self.providers.len());
        for (index, provider) in self.providers.iter().enumerate() {
            names.push(provider.name().to_string());
            let provider = provider.clone();
            let ctx = ctx.child();
            let path = path.to_path_buf();
            // the inner task turns a provider panic into a JoinError we can attribute
            tasks.spawn(async move {
                let analysis = tokio::spawn(async move { provider.analyze(&ctx, &path).await });
                (index, analysis.await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    log::warn!("Diagnostics collection task failed: {e}");
                    continue;
                }
            };
            let name = &names[index];
            match outcome {
                Err(e) => {
                    log::warn!("{name} panicked for {}: {e}", path.display());
                    aggregate.failures.push(ProviderFailure {
                        provider: name.clone(),
                        error: e.to_string(),
                    });
                }
                Ok(Ok(mut diagnostics)) => {
                    log::debug!(
                        "{name} produced {} diagnostics for {}",
                        diagnostics.len(),
                        path.display()
                    );
                    aggregate.diagnostics.append(&mut diagnostics);
                }
                Ok(Err(e)) if e.is_cancellation() => {
                    log::trace!("{name} cancelled for {}", path.display());
                }
                Ok(Err(e)) => {
                    log::warn!("{name} failed for {}: {e}", path.display());
                    aggregate.failures.push(failure(name, &e));
                }
            }
        }

        aggregate
    }
}

fn failure(provider: &str, error: &ProviderError) -> ProviderFailure {
    ProviderFailure {
        provider: provider.to_string(),
        error: error.to_string(),
    }
}
