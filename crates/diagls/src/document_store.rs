//
// document_store.rs
//
// Contents of the documents the client has open
//

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ropey::Rope;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

use crate::utf16::utf16_offset_to_char_offset;

/// An open document
#[derive(Debug, Clone)]
pub struct Document {
    /// LSP document version
    pub version: i32,
    /// File content as a rope for efficient editing
    pub contents: Rope,
}

impl Document {
    pub fn new(text: &str, version: i32) -> Self {
        Self {
            version,
            contents: Rope::from_str(text),
        }
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }

    fn apply_change(&mut self, change: TextDocumentContentChangeEvent) {
        let Some(range) = change.range else {
            // full document sync
            self.contents = Rope::from_str(&change.text);
            return;
        };

        let start = self.char_index(range.start.line as usize, range.start.character as usize);
        let end = self
            .char_index(range.end.line as usize, range.end.character as usize)
            .max(start);
        self.contents.remove(start..end);
        self.contents.insert(start, &change.text);
    }

    /// Char index of an LSP position; positions past the end clamp to it.
    fn char_index(&self, line: usize, utf16_char: usize) -> usize {
        if line >= self.contents.len_lines() {
            return self.contents.len_chars();
        }
        let line_text = self.contents.line(line).to_string();
        let line_text = line_text.trim_end_matches(['\n', '\r']);
        self.contents.line_to_char(line) + utf16_offset_to_char_offset(line_text, utf16_char)
    }
}

/// Shared document cache.
///
/// Many readers, short exclusive writes. Cloning shares the same cache.
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    documents: Arc<RwLock<HashMap<Url, Document>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Url, Document>> {
        self.documents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Url, Document>> {
        self.documents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self, uri: Url, text: &str, version: i32) {
        self.write().insert(uri, Document::new(text, version));
    }

    /// Apply content changes in order. Returns false if the document is not open.
    pub fn update(&self, uri: &Url, changes: Vec<TextDocumentContentChangeEvent>, version: i32) -> bool {
        let mut documents = self.write();
        let Some(document) = documents.get_mut(uri) else {
            return false;
        };
        for change in changes {
            document.apply_change(change);
        }
        document.version = version;
        true
    }

    /// Replace the whole text, keeping the version. Used for save with text.
    pub fn replace_text(&self, uri: &Url, text: &str) -> bool {
        let mut documents = self.write();
        let Some(document) = documents.get_mut(uri) else {
            return false;
        };
        document.contents = Rope::from_str(text);
        true
    }

    pub fn close(&self, uri: &Url) -> Option<Document> {
        self.write().remove(uri)
    }

    pub fn get(&self, uri: &Url) -> Option<Document> {
        self.read().get(uri).cloned()
    }

    pub fn text(&self, uri: &Url) -> Option<String> {
        self.read().get(uri).map(Document::text)
    }

    pub fn version(&self, uri: &Url) -> Option<i32> {
        self.read().get(uri).map(|document| document.version)
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.read().contains_key(uri)
    }

    pub fn uris(&self) -> Vec<Url> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
