//
// handlers.rs
//
// Capabilities and reply construction for LSP requests
//

use tower_lsp::lsp_types::*;

use crate::utf16::utf16_len;

pub const SERVER_NAME: &str = "diagls";

pub const SHOW_CONFIG_COMMAND: &str = "diagls/showConfig";
pub const SHOW_PROVIDERS_COMMAND: &str = "diagls/showProviders";

pub const COMMANDS: [&str; 2] = [SHOW_CONFIG_COMMAND, SHOW_PROVIDERS_COMMAND];

pub fn capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(
            TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::FULL),
                save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                    include_text: Some(false),
                })),
                ..Default::default()
            },
        )),
        document_formatting_provider: Some(OneOf::Left(true)),
        execute_command_provider: Some(ExecuteCommandOptions {
            commands: COMMANDS.iter().map(|command| command.to_string()).collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn server_info() -> ServerInfo {
    ServerInfo {
        name: String::from(SERVER_NAME),
        version: Some(String::from(env!("CARGO_PKG_VERSION"))),
    }
}

pub fn initialize_result() -> InitializeResult {
    InitializeResult {
        capabilities: capabilities(),
        server_info: Some(server_info()),
    }
}

/// Edits turning `original` into `formatted`: nothing when they match,
/// otherwise a single edit replacing the whole document.
pub fn full_document_edit(original: &str, formatted: &str) -> Vec<TextEdit> {
    if original == formatted {
        return Vec::new();
    }
    vec![TextEdit {
        range: Range::new(Position::new(0, 0), document_end(original)),
        new_text: formatted.to_string(),
    }]
}

/// Position just past the last character of `text`.
pub fn document_end(text: &str) -> Position {
    // split('\n') yields a trailing "" after a final newline, which is the
    // position editors expect
    let mut lines = 0u32;
    let mut last = "";
    for line in text.split('\n') {
        lines += 1;
        last = line;
    }
    Position::new(lines.saturating_sub(1), utf16_len(last))
}

/// Render the provider listing shown by `diagls/showProviders`.
pub fn describe_providers(diagnostics: &[String], formatters: &[String]) -> String {
    let list = |names: &[String]| {
        if names.is_empty() {
            String::from("none")
        } else {
            names.join(", ")
        }
    };
    format!(
        "Diagnostics providers: {}\nFormatting providers: {}",
        list(diagnostics),
        list(formatters)
    )
}
