//
// providers/php_cs_fixer.rs
//
// Coding style warnings and document formatting with PHP-CS-Fixer
//

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString};

use super::{
    shell_quote, BuiltProvider, DiagnosticsProvider, FormattingProvider, ProviderError,
    ProviderSetup,
};
use crate::context::RequestContext;
use crate::diff;

pub const ID: &str = "phpcsfixer";
pub const NAME: &str = "php-cs-fixer";

/// `fix` exits with 8 when it found something to change.
const EXIT_CHANGES_FOUND: i32 = 8;

#[derive(Debug, Default, Deserialize)]
struct FixReport {
    #[serde(default)]
    files: Vec<FixedFile>,
}

#[derive(Debug, Deserialize)]
struct FixedFile {
    #[serde(default)]
    diff: String,
    #[serde(default, rename = "appliedFixers")]
    applied_fixers: Vec<String>,
}

fn parse_fix_report(stdout: &str) -> Result<FixReport, ProviderError> {
    if stdout.trim().is_empty() {
        return Ok(FixReport::default());
    }
    serde_json::from_str(stdout)
        .map_err(|e| ProviderError::MalformedOutput(format!("php-cs-fixer report: {e}")))
}

fn description_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"Description of .* rule\.").unwrap(),
            Regex::new(r"(?s)(Fixer is configurable|Fixer applying).*").unwrap(),
            Regex::new(r"(?s)Fixing examples:.*").unwrap(),
        ]
    })
}

/// Reduce `describe <rule>` output to the rule's summary sentence(s).
pub fn clean_description(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    for pattern in description_patterns() {
        text = pattern.replace_all(&text, "").into_owned();
    }
    text.trim().to_string()
}

pub struct PhpCsFixer {
    setup: ProviderSetup,
    descriptions: Mutex<HashMap<String, String>>,
}

pub fn build(setup: ProviderSetup) -> BuiltProvider {
    let formats = setup.config.format.enabled;
    let provider = Arc::new(PhpCsFixer::new(setup));
    BuiltProvider {
        diagnostics: provider.clone(),
        formatter: formats.then(|| provider as Arc<dyn FormattingProvider>),
    }
}

impl PhpCsFixer {
    pub fn new(setup: ProviderSetup) -> Self {
        Self {
            setup,
            descriptions: Mutex::new(HashMap::new()),
        }
    }

    fn config_arg(&self) -> String {
        self.setup
            .config
            .config_file()
            .map(|file| format!(" --config {}", shell_quote(file)))
            .unwrap_or_default()
    }

    fn dry_run_command(&self, relative: &str, rule: Option<&str>) -> String {
        let selection = match rule {
            Some(rule) => format!(" --rules {}", shell_quote(rule)),
            None => self.config_arg(),
        };
        format!(
            "{} fix {relative} --dry-run --diff --verbose --format json{selection} 2>/dev/null",
            self.setup.config.path
        )
    }

    fn cached_description(&self, rule: &str) -> Option<String> {
        self.descriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(rule)
            .cloned()
    }

    async fn describe(&self, ctx: &RequestContext, rule: &str) -> String {
        if let Some(description) = self.cached_description(rule) {
            return description;
        }

        let command = format!(
            "{} describe {} 2>/dev/null",
            self.setup.config.path,
            shell_quote(rule)
        );
        let result = self.setup.run(ctx, &command, None).await;
        let description = clean_description(&result.stdout_text());
        if description.is_empty() {
            // not cached: a later run may succeed
            return rule.to_string();
        }

        self.descriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(rule.to_string(), description.clone());
        description
    }
}

#[async_trait]
impl DiagnosticsProvider for PhpCsFixer {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        NAME
    }

    /// One fixer run finds the rules that apply; each rule is then run on
    /// its own so its diff can be attributed to it.
    async fn analyze(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let ctx = ctx.with_default_timeout(self.setup.config.timeout());
        let relative = self.setup.relative_path(path);

        let result = self
            .setup
            .run(&ctx, &self.dry_run_command(&relative, None), None)
            .await;
        if let Some(error) = &result.error {
            return Err(error.clone().into());
        }
        let report = parse_fix_report(&result.stdout_text())?;

        let mut rules: Vec<String> = Vec::new();
        for rule in report.files.into_iter().flat_map(|file| file.applied_fixers) {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }

        let mut diagnostics = Vec::new();
        for rule in rules {
            if ctx.interrupted().is_some() {
                return Err(ProviderError::Cancelled);
            }

            let result = self
                .setup
                .run(&ctx, &self.dry_run_command(&relative, Some(&rule)), None)
                .await;
            match &result.error {
                Some(error) if error.is_cancellation() => return Err(error.clone().into()),
                Some(error) => {
                    log::warn!("php-cs-fixer run for rule {rule} failed: {error}");
                    continue;
                }
                None => {}
            }

            let rule_report = parse_fix_report(&result.stdout_text())?;
            for file in rule_report.files {
                if file.diff.is_empty() {
                    continue;
                }
                let ranges = diff::diagnose(&file.diff);
                if ranges.is_empty() {
                    continue;
                }
                let message = self.describe(&ctx, &rule).await;
                diagnostics.extend(ranges.into_iter().map(|range| Diagnostic {
                    range,
                    severity: Some(DiagnosticSeverity::WARNING),
                    code: Some(NumberOrString::String(rule.clone())),
                    source: Some(NAME.to_string()),
                    message: message.clone(),
                    ..Default::default()
                }));
            }
        }

        Ok(diagnostics)
    }
}

#[async_trait]
impl FormattingProvider for PhpCsFixer {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn format(
        &self,
        ctx: &RequestContext,
        _path: &Path,
        content: &str,
    ) -> Result<String, ProviderError> {
        let format = &self.setup.config.format;
        if !format.enabled {
            return Err(ProviderError::FormattingDisabled(NAME.to_string()));
        }

        let ctx = ctx.with_default_timeout(format.timeout());
        let command = format!("{} fix - --diff{}", self.setup.config.path, self.config_arg());

        let started = std::time::Instant::now();
        let result = self.setup.run(&ctx, &command, Some(content)).await;
        if let Some(error) = &result.error {
            return Err(error.clone().into());
        }

        match result.exit_code {
            Some(0) => log::debug!("php-cs-fixer found nothing to change in {:?}", started.elapsed()),
            Some(EXIT_CHANGES_FOUND) => {
                log::debug!("php-cs-fixer found changes in {:?}", started.elapsed())
            }
            code => {
                return Err(ProviderError::UnexpectedExit {
                    code,
                    stderr: result.stderr_text().trim().to_string(),
                })
            }
        }

        let patch = result.stdout_text();
        if patch.trim().is_empty() {
            return Ok(content.to_string());
        }
        Ok(diff::apply(content, &patch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::gateway::{CommandError, CommandResult};
    use crate::test_utils::ScriptedRunner;
    use tower_lsp::lsp_types::Position;

    const FULL_REPORT: &str = r#"{ "files": [ {
        "name": "src/Foo.php",
        "diff": "--- Original\n+++ New\n@@ -1,3 +1,3 @@\n <?php\n-$a = array();\n+$a = [];\n",
        "appliedFixers": ["array_syntax", "blank_line_before_statement"]
    } ] }"#;

    const ARRAY_SYNTAX_REPORT: &str = r#"{ "files": [ {
        "name": "src/Foo.php",
        "diff": "--- Original\n+++ New\n@@ -1,3 +1,3 @@\n <?php\n-$a = array();\n+$a = [];\n",
        "appliedFixers": ["array_syntax"]
    } ] }"#;

    const BLANK_LINE_REPORT: &str = r#"{ "files": [ {
        "name": "src/Foo.php",
        "diff": "--- Original\n+++ New\n@@ -3,2 +3,3 @@\n foo();\n+\n return 1;\n",
        "appliedFixers": ["blank_line_before_statement"]
    } ] }"#;

    fn provider(runner: Arc<ScriptedRunner>, format_enabled: bool) -> PhpCsFixer {
        let raw = format!(
            r#"{{ "diagnosticsProviders": {{ "phpcsfixer": {{ "enabled": true, "container": "app",
                "path": "vendor/bin/php-cs-fixer", "configFile": ".php-cs-fixer.php",
                "format": {{ "enabled": {format_enabled} }} }} }} }}"#
        );
        let config = ProjectConfig::parse(Path::new("/project"), raw).unwrap();
        PhpCsFixer::new(ProviderSetup {
            root: config.root.clone(),
            config: config.providers["phpcsfixer"].clone(),
            runner,
        })
    }

    #[test]
    fn test_clean_description_strips_configuration_section() {
        let raw = "Description of array_syntax rule.\nPHP arrays should be declared using the configured syntax.\nFixer is configurable.\nUsing @PSR12 ruleset.";
        assert_eq!(
            clean_description(raw),
            "PHP arrays should be declared using the configured syntax."
        );
    }

    #[test]
    fn test_clean_description_strips_examples_and_priority() {
        let examples = "Description of blank_line_before_statement rule.\nAn empty line should precede certain statements.\nFixing examples:\nExample #1\n----------\n--- Original\n+++ New\n@@ ...";
        assert_eq!(
            clean_description(examples),
            "An empty line should precede certain statements."
        );

        let priority = "Description of some_rule rule.\nThis is the rule description.\nFixer applying priority: 50\nSome other info.";
        assert_eq!(clean_description(priority), "This is the rule description.");
        assert_eq!(
            clean_description("Description of simple_rule rule.\nSimple description."),
            "Simple description."
        );
    }

    #[tokio::test]
    async fn test_analyze_attributes_diff_to_each_rule() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("--dry-run", CommandResult::completed(8, FULL_REPORT, ""));
        runner.respond("--rules array_syntax", CommandResult::completed(8, ARRAY_SYNTAX_REPORT, ""));
        runner.respond(
            "--rules blank_line_before_statement",
            CommandResult::completed(8, BLANK_LINE_REPORT, ""),
        );
        runner.respond(
            "describe array_syntax",
            CommandResult::completed(0, "Description of array_syntax rule.\nUse short arrays.\nFixer is configurable.", ""),
        );

        let diagnostics = provider(runner.clone(), false)
            .analyze(&RequestContext::new(), Path::new("/project/src/Foo.php"))
            .await
            .unwrap();

        assert_eq!(diagnostics.len(), 2);
        let array = &diagnostics[0];
        assert_eq!(array.range.start, Position::new(1, 0));
        assert_eq!(array.range.end, Position::new(1, 13));
        assert_eq!(array.severity, Some(DiagnosticSeverity::WARNING));
        assert_eq!(array.code, Some(NumberOrString::String("array_syntax".into())));
        assert_eq!(array.message, "Use short arrays.");

        let blank = &diagnostics[1];
        assert_eq!(blank.range.start, Position::new(3, 0));
        assert_eq!(blank.range.end, Position::new(3, 0));
        // describe produced nothing, so the rule name stands in
        assert_eq!(blank.message, "blank_line_before_statement");

        let commands = runner.commands();
        assert_eq!(
            commands[0],
            "vendor/bin/php-cs-fixer fix src/Foo.php --dry-run --diff --verbose --format json \
             --config .php-cs-fixer.php 2>/dev/null"
        );
        assert!(commands.iter().any(|c| c.ends_with("--rules array_syntax 2>/dev/null")));
    }

    #[tokio::test]
    async fn test_descriptions_are_cached() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("--dry-run", CommandResult::completed(8, ARRAY_SYNTAX_REPORT, ""));
        runner.respond(
            "describe array_syntax",
            CommandResult::completed(0, "Description of array_syntax rule.\nUse short arrays.", ""),
        );
        let provider = provider(runner.clone(), false);
        let path = Path::new("/project/src/Foo.php");

        provider.analyze(&RequestContext::new(), path).await.unwrap();
        provider.analyze(&RequestContext::new(), path).await.unwrap();
        assert_eq!(runner.count_matching("describe"), 1);
    }

    #[tokio::test]
    async fn test_analyze_clean_file() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("--dry-run", CommandResult::completed(0, r#"{ "files": [] }"#, ""));
        let diagnostics = provider(runner.clone(), false)
            .analyze(&RequestContext::new(), Path::new("/project/src/Foo.php"))
            .await
            .unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_format_applies_diff_from_stdin_run() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "fix -",
            CommandResult::completed(
                8,
                "--- Original\n+++ New\n@@ -1,2 +1,2 @@\n <?php\n-$a = array();\n+$a = [];\n",
                "",
            ),
        );
        let formatted = provider(runner.clone(), true)
            .format(&RequestContext::new(), Path::new("/project/src/Foo.php"), "<?php\n$a = array();\n")
            .await
            .unwrap();
        assert_eq!(formatted, "<?php\n$a = [];\n");

        let calls = runner.calls();
        assert_eq!(calls[0].command, "vendor/bin/php-cs-fixer fix - --diff --config .php-cs-fixer.php");
        assert_eq!(calls[0].stdin.as_deref(), Some("<?php\n$a = array();\n"));
    }

    #[tokio::test]
    async fn test_format_without_changes_returns_content() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("fix -", CommandResult::completed(0, "", ""));
        let formatted = provider(runner, true)
            .format(&RequestContext::new(), Path::new("/project/a.php"), "<?php\n")
            .await
            .unwrap();
        assert_eq!(formatted, "<?php\n");
    }

    #[tokio::test]
    async fn test_format_failure_exit_code() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("fix -", CommandResult::completed(16, "", "Configuration error"));
        let err = provider(runner, true)
            .format(&RequestContext::new(), Path::new("/project/a.php"), "<?php\n")
            .await
            .unwrap_err();
        match err {
            ProviderError::UnexpectedExit { code, stderr } => {
                assert_eq!(code, Some(16));
                assert_eq!(stderr, "Configuration error");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_format_disabled() {
        let runner = Arc::new(ScriptedRunner::new());
        let err = provider(runner.clone(), false)
            .format(&RequestContext::new(), Path::new("/project/a.php"), "<?php\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::FormattingDisabled(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_format_cancelled() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("fix -", CommandResult::failed(CommandError::DeadlineExceeded));
        let err = provider(runner, true)
            .format(&RequestContext::new(), Path::new("/project/a.php"), "<?php\n")
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_build_exposes_formatter_only_when_enabled() {
        let runner = Arc::new(ScriptedRunner::new());
        let raw = r#"{ "diagnosticsProviders": { "phpcsfixer": { "enabled": true, "container": "app", "path": "x" } } }"#;
        let config = ProjectConfig::parse(Path::new("/project"), raw.to_string()).unwrap();
        let built = build(ProviderSetup {
            root: config.root.clone(),
            config: config.providers["phpcsfixer"].clone(),
            runner,
        });
        assert!(built.formatter.is_none());
        assert_eq!(built.diagnostics.id(), "phpcsfixer");
    }
}
