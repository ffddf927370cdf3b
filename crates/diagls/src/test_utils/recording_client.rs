//
// test_utils/recording_client.rs
//
// ClientSink that keeps everything the server sends
//

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tower_lsp::lsp_types::{Diagnostic, MessageType, Url};

use crate::session::ClientSink;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub uri: Url,
    pub diagnostics: Vec<Diagnostic>,
    pub version: Option<i32>,
}

pub struct RecordingClient {
    published: Mutex<Vec<Published>>,
    messages: Mutex<Vec<(MessageType, String)>>,
    publish_count: watch::Sender<usize>,
}

impl Default for RecordingClient {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            publish_count: watch::channel(0).0,
        }
    }
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Every diagnostics set published for `uri`, oldest first.
    pub fn published_for(&self, uri: &Url) -> Vec<Vec<Diagnostic>> {
        self.published()
            .into_iter()
            .filter(|p| &p.uri == uri)
            .map(|p| p.diagnostics)
            .collect()
    }

    pub fn messages(&self) -> Vec<(MessageType, String)> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait until at least `count` publications have been recorded in total.
    pub async fn wait_for_publications(&self, count: usize) {
        let mut rx = self.publish_count.subscribe();
        while *rx.borrow_and_update() < count {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl ClientSink for RecordingClient {
    async fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        let total = {
            let mut published = self
                .published
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            published.push(Published {
                uri,
                diagnostics,
                version,
            });
            published.len()
        };
        self.publish_count.send_replace(total);
    }

    async fn show_message(&self, typ: MessageType, message: String) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((typ, message));
    }
}
