//
// providers/php_lint.rs
//
// Syntax check with `php -l`
//

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range};

use super::{BuiltProvider, DiagnosticsProvider, ProviderError, ProviderSetup};
use crate::context::RequestContext;

pub const ID: &str = "phplint";
pub const NAME: &str = "php-lint";

const CLEAN_PREFIX: &str = "No syntax errors detected";
const LINE_SPAN: u32 = 100;

fn lint_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?:Fatal|Parse) error:\s+(.*) in .* on line (\d+)").unwrap())
}

pub struct PhpLint {
    setup: ProviderSetup,
}

pub fn build(setup: ProviderSetup) -> BuiltProvider {
    BuiltProvider {
        diagnostics: Arc::new(PhpLint::new(setup)),
        formatter: None,
    }
}

impl PhpLint {
    pub fn new(setup: ProviderSetup) -> Self {
        Self { setup }
    }
}

/// Extract the syntax error reported by `php -l`, if any.
pub fn parse_lint_output(output: &str) -> Option<Diagnostic> {
    if output.trim_start().starts_with(CLEAN_PREFIX) {
        return None;
    }
    let caps = lint_error_pattern().captures(output)?;
    let line: u32 = caps[2].parse().ok()?;
    let line = line.saturating_sub(1);

    Some(Diagnostic {
        range: Range {
            start: Position::new(line, 0),
            end: Position::new(line, LINE_SPAN),
        },
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some(NAME.to_string()),
        message: caps[1].trim().to_string(),
        ..Default::default()
    })
}

#[async_trait]
impl DiagnosticsProvider for PhpLint {
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
        let command = format!(
            "{} -l {} 2>&1",
            self.setup.config.path,
            self.setup.relative_path(path)
        );
        let result = self.setup.run(&ctx, &command, None).await;
        if let Some(error) = &result.error {
            return Err(error.clone().into());
        }

        let output = result.stdout_text();
        if let Some(diagnostic) = parse_lint_output(&output) {
            return Ok(vec![diagnostic]);
        }
        if result.exit_code != Some(0) {
            return Err(ProviderError::UnexpectedExit {
                code: result.exit_code,
                stderr: output.trim().to_string(),
            });
        }
        Ok(Vec::new())
    }
}
