//
// providers/phpstan.rs
//
// Static analysis findings from PHPStan's JSON report
//

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString, Position, Range};

use super::{BuiltProvider, DiagnosticsProvider, ProviderError, ProviderSetup};
use crate::context::RequestContext;

pub const ID: &str = "phpstan";
pub const NAME: &str = "phpstan";

/// PHPStan reports lines only; the range spans this many columns.
const LINE_SPAN: u32 = 100;

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    files: Files,
}

/// A clean run serializes `files` as an empty JSON array rather than an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Files {
    ByPath(BTreeMap<String, FileReport>),
    Empty(Vec<serde_json::Value>),
}

impl Default for Files {
    fn default() -> Self {
        Files::Empty(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct FileReport {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message: String,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    ignorable: bool,
    #[serde(default)]
    identifier: Option<String>,
}

pub struct PhpStan {
    setup: ProviderSetup,
}

pub fn build(setup: ProviderSetup) -> BuiltProvider {
    BuiltProvider {
        diagnostics: Arc::new(PhpStan::new(setup)),
        formatter: None,
    }
}

impl PhpStan {
    pub fn new(setup: ProviderSetup) -> Self {
        Self { setup }
    }

    fn command(&self, path: &Path) -> String {
        let mut command = format!(
            "{} analyze {} --memory-limit=-1 --no-progress --error-format=json",
            self.setup.config.path,
            self.setup.relative_path(path)
        );
        if let Some(config_file) = self.setup.config.config_file() {
            command.push_str(&format!(" --configuration={config_file}"));
        }
        command.push_str(" 2>/dev/null");
        command
    }
}

/// Turn PHPStan's `--error-format=json` output into diagnostics.
pub fn parse_report(stdout: &str) -> Result<Vec<Diagnostic>, ProviderError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let report: Report = serde_json::from_str(stdout)
        .map_err(|e| ProviderError::MalformedOutput(format!("phpstan report: {e}")))?;

    let Files::ByPath(files) = report.files else {
        return Ok(Vec::new());
    };

    let diagnostics = files
        .into_values()
        .flat_map(|file| file.messages)
        .map(|message| {
            let line = message.line.unwrap_or(0).saturating_sub(1);
            Diagnostic {
                range: Range {
                    start: Position::new(line, 0),
                    end: Position::new(line, LINE_SPAN),
                },
                severity: Some(if message.ignorable {
                    DiagnosticSeverity::WARNING
                } else {
                    DiagnosticSeverity::ERROR
                }),
                code: message.identifier.map(NumberOrString::String),
                source: Some(NAME.to_string()),
                message: message.message,
                ..Default::default()
            }
        })
        .collect();
    Ok(diagnostics)
}

#[async_trait]
impl DiagnosticsProvider for PhpStan {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn analyze(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let ctx = ctx.with_default_timeout(self.setup.config.timeout());
        let result = self.setup.run(&ctx, &self.command(path), None).await;
        if let Some(error) = &result.error {
            return Err(error.clone().into());
        }
        // exit code 1 means "errors found"; the report is authoritative
        parse_report(&result.stdout_text())
    }
}
