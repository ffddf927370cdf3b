//
// session.rs
//
// Protocol lifecycle and request handling, independent of the transport
//

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::*;

use crate::aggregator::{Aggregate, DiagnosticAggregator, IgnoreRules};
use crate::config::{ConfigError, ProjectConfig, ServerSettings};
use crate::context::RequestContext;
use crate::document_store::DocumentStore;
use crate::gateway::CommandRunner;
use crate::handlers;
use crate::providers::{FormattingProvider, ProviderError, ProviderRegistry};
use crate::scheduler::{DebouncedScheduler, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    /// `initialize` answered, `initialized` not yet received
    InitializeAcknowledged,
    Initialized,
    ShuttingDown,
    Exited,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("server is already initialized")]
    AlreadyInitialized,
    #[error("server is not initialized")]
    NotInitialized,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("server has exited")]
    Exited,
}

/// The LSP lifecycle as explicit transitions.
#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn begin_initialize(&mut self) -> Result<(), LifecycleError> {
        match self.phase {
            Phase::Uninitialized => {
                self.phase = Phase::InitializeAcknowledged;
                Ok(())
            }
            Phase::InitializeAcknowledged | Phase::Initialized => {
                Err(LifecycleError::AlreadyInitialized)
            }
            Phase::ShuttingDown => Err(LifecycleError::ShuttingDown),
            Phase::Exited => Err(LifecycleError::Exited),
        }
    }

    pub fn initialized(&mut self) -> Result<(), LifecycleError> {
        match self.phase {
            Phase::InitializeAcknowledged => {
                self.phase = Phase::Initialized;
                Ok(())
            }
            Phase::Initialized => Err(LifecycleError::AlreadyInitialized),
            Phase::Uninitialized => Err(LifecycleError::NotInitialized),
            Phase::ShuttingDown => Err(LifecycleError::ShuttingDown),
            Phase::Exited => Err(LifecycleError::Exited),
        }
    }

    pub fn shutdown(&mut self) -> Result<(), LifecycleError> {
        match self.phase {
            Phase::InitializeAcknowledged | Phase::Initialized => {
                self.phase = Phase::ShuttingDown;
                Ok(())
            }
            Phase::Uninitialized => Err(LifecycleError::NotInitialized),
            Phase::ShuttingDown => Err(LifecycleError::ShuttingDown),
            Phase::Exited => Err(LifecycleError::Exited),
        }
    }

    /// Always succeeds. Returns false when `shutdown` did not come first.
    pub fn exit(&mut self) -> bool {
        let orderly = self.phase == Phase::ShuttingDown;
        self.phase = Phase::Exited;
        orderly
    }

    pub fn accepts_documents(&self) -> bool {
        self.phase == Phase::Initialized
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The server cannot run without a project configuration.
    #[error("project configuration unavailable: {0}")]
    ConfigMissing(#[from] ConfigError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ConfigMissing(_))
    }
}

/// Everything the session sends to the client.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>);
    async fn show_message(&self, typ: MessageType, message: String);
}

#[async_trait]
impl ClientSink for tower_lsp::Client {
    async fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        tower_lsp::Client::publish_diagnostics(self, uri, diagnostics, version).await;
    }

    async fn show_message(&self, typ: MessageType, message: String) {
        tower_lsp::Client::show_message(self, typ, message).await;
    }
}

/// State that exists once `initialize` has loaded the project.
struct Workspace {
    config: ProjectConfig,
    aggregator: Arc<DiagnosticAggregator>,
    formatters: Vec<Arc<dyn FormattingProvider>>,
    diagnostics: DebouncedScheduler,
    formatting: DebouncedScheduler,
}

pub struct Session {
    client: Arc<dyn ClientSink>,
    runner: Arc<dyn CommandRunner>,
    registry: ProviderRegistry,
    lifecycle: Mutex<Lifecycle>,
    /// Parent of every context handed to providers; cancelled on exit
    root: CancellationToken,
    documents: DocumentStore,
    workspace: OnceLock<Arc<Workspace>>,
}

impl Session {
    pub fn new(client: Arc<dyn ClientSink>, runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_registry(client, runner, ProviderRegistry::with_builtin())
    }

    pub fn with_registry(
        client: Arc<dyn ClientSink>,
        runner: Arc<dyn CommandRunner>,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            client,
            runner,
            registry,
            lifecycle: Mutex::new(Lifecycle::new()),
            root: CancellationToken::new(),
            documents: DocumentStore::new(),
            workspace: OnceLock::new(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle().phase()
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.workspace.get().map(|ws| ws.config.root.as_path())
    }

    pub fn diagnostics_provider_names(&self) -> Vec<String> {
        self.workspace
            .get()
            .map(|ws| {
                ws.aggregator
                    .providers()
                    .iter()
                    .map(|p| p.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn formatting_provider_names(&self) -> Vec<String> {
        self.workspace
            .get()
            .map(|ws| ws.formatters.iter().map(|p| p.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Workspace for document traffic, or None outside the `Initialized` phase.
    fn active_workspace(&self) -> Option<Arc<Workspace>> {
        if !self.lifecycle().accepts_documents() {
            log::debug!("Ignoring document notification in phase {:?}", self.phase());
            return None;
        }
        self.workspace.get().cloned()
    }

    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, SessionError> {
        self.lifecycle().begin_initialize()?;
        log::info!("Initializing {}", handlers::SERVER_NAME);

        let root = resolve_root(&params);
        log::info!("Project root: {}", root.display());

        let config = match ProjectConfig::load(&root) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Cannot start without a project configuration: {e}");
                return Err(e.into());
            }
        };
        let settings = ServerSettings::from_initialization_options(params.initialization_options.as_ref());

        let loaded = self.registry.load(&config, self.runner.clone()).await;
        for error in loaded.errors {
            self.client.show_message(MessageType::ERROR, error).await;
        }
        log::info!(
            "Loaded {} diagnostics and {} formatting providers",
            loaded.diagnostics.len(),
            loaded.formatters.len()
        );

        let ignore = IgnoreRules::new(&config.root, &config.ignored_paths);
        let workspace = Workspace {
            aggregator: Arc::new(DiagnosticAggregator::new(loaded.diagnostics, ignore)),
            formatters: loaded.formatters,
            diagnostics: DebouncedScheduler::with_root(
                OperationKind::Diagnostics,
                settings.diagnostics_debounce,
                self.root.child_token(),
            ),
            formatting: DebouncedScheduler::with_root(
                OperationKind::Formatting,
                settings.formatting_debounce,
                self.root.child_token(),
            ),
            config,
        };
        if self.workspace.set(Arc::new(workspace)).is_err() {
            return Err(LifecycleError::AlreadyInitialized.into());
        }

        Ok(handlers::initialize_result())
    }

    pub fn initialized(&self) {
        match self.lifecycle().initialized() {
            Ok(()) => log::info!("{} initialized", handlers::SERVER_NAME),
            Err(e) => log::warn!("Unexpected initialized notification: {e}"),
        }
    }

    pub fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(workspace) = self.active_workspace() else {
            return;
        };
        let doc = params.text_document;
        self.documents.open(doc.uri.clone(), &doc.text, doc.version);
        self.schedule_diagnostics(&workspace, doc.uri, false);
    }

    pub fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(workspace) = self.active_workspace() else {
            return;
        };
        let uri = params.text_document.uri;
        if !self
            .documents
            .update(&uri, params.content_changes, params.text_document.version)
        {
            log::debug!("Change for unopened document {uri}");
        }
        self.schedule_diagnostics(&workspace, uri, false);
    }

    pub fn did_save(&self, params: DidSaveTextDocumentParams) {
        let Some(workspace) = self.active_workspace() else {
            return;
        };
        let uri = params.text_document.uri;
        if let Some(text) = params.text {
            self.documents.replace_text(&uri, &text);
        }
        self.schedule_diagnostics(&workspace, uri, true);
    }

    pub fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Some(workspace) = self.active_workspace() else {
            return;
        };
        let uri = params.text_document.uri;
        self.documents.close(&uri);
        self.schedule_diagnostics(&workspace, uri, false);
    }

    pub fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        let Some(workspace) = self.active_workspace() else {
            return;
        };
        for change in params.changes {
            let Ok(path) = change.uri.to_file_path() else {
                continue;
            };
            if !workspace.config.is_watched(&path) {
                continue;
            }
            if change.typ == FileChangeType::DELETED {
                self.schedule_clear(&workspace, change.uri, true);
            } else {
                self.schedule_diagnostics(&workspace, change.uri, false);
            }
        }
    }

    fn schedule_diagnostics(&self, workspace: &Workspace, uri: Url, priority: bool) {
        let Ok(path) = uri.to_file_path() else {
            log::debug!("Not analyzing non-file URI {uri}");
            return;
        };
        let aggregator = workspace.aggregator.clone();
        let client = self.client.clone();
        let documents = self.documents.clone();
        let target = uri.clone();

        let work = move |ctx: RequestContext| async move { aggregator.collect(&ctx, &path).await };
        let publish = move |aggregate: Aggregate| async move {
            for failure in &aggregate.failures {
                client.show_message(MessageType::ERROR, failure.message()).await;
            }
            let version = documents.version(&target);
            client
                .publish_diagnostics(target, aggregate.diagnostics, version)
                .await;
        };

        if priority {
            workspace.diagnostics.schedule_priority(uri, work, publish);
        } else {
            workspace.diagnostics.schedule(uri, work, publish);
        }
    }

    /// Publish an empty set through the diagnostics scheduler, so a run
    /// still in flight for the same document cannot bring results back.
    fn schedule_clear(&self, workspace: &Workspace, uri: Url, priority: bool) {
        let client = self.client.clone();
        let target = uri.clone();
        let work = |_ctx: RequestContext| async {};
        let publish = move |()| async move {
            client.publish_diagnostics(target, Vec::new(), None).await;
        };

        if priority {
            workspace.diagnostics.schedule_priority(uri, work, publish);
        } else {
            workspace.diagnostics.schedule(uri, work, publish);
        }
    }

    /// Format a whole document. Returns no edits when nothing changed, no
    /// formatter is loaded, or the request was superseded or failed.
    pub async fn formatting(&self, params: DocumentFormattingParams) -> Vec<TextEdit> {
        let Some(workspace) = self.active_workspace() else {
            return Vec::new();
        };
        let uri = params.text_document.uri;
        let Some(formatter) = workspace.formatters.first().cloned() else {
            log::debug!("No formatting provider loaded");
            return Vec::new();
        };
        let Ok(path) = uri.to_file_path() else {
            return Vec::new();
        };

        let original = match self.documents.text(&uri) {
            Some(text) => text,
            None => match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("Cannot read {} for formatting: {e}", path.display());
                    return Vec::new();
                }
            },
        };

        let (reply, edits) = oneshot::channel();
        let client = self.client.clone();
        let content = original.clone();
        let name = formatter.name().to_string();

        // cancelled when the client abandons the request and this future is dropped
        let request = CancellationToken::new();
        let _cancel_on_drop = request.clone().drop_guard();

        workspace.formatting.schedule(
            uri,
            move |ctx: RequestContext| async move {
                if request.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                let ctx = ctx.child();
                let run = formatter.format(&ctx, &path, &content);
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = request.cancelled() => {
                        ctx.cancel();
                        run.await
                    }
                }
            },
            move |result| async move {
                let edits = match result {
                    Ok(formatted) => handlers::full_document_edit(&original, &formatted),
                    Err(e) if e.is_cancellation() => {
                        log::trace!("Formatting with {name} cancelled");
                        Vec::new()
                    }
                    Err(e) => {
                        log::warn!("Formatting with {name} failed: {e}");
                        client
                            .show_message(MessageType::WARNING, format!("Formatting with {name} failed: {e}"))
                            .await;
                        Vec::new()
                    }
                };
                let _ = reply.send(edits);
            },
        );

        // a superseded request drops the sender
        edits.await.unwrap_or_default()
    }

    pub async fn execute_command(&self, params: ExecuteCommandParams) -> Result<(), SessionError> {
        let workspace = self
            .workspace
            .get()
            .cloned()
            .ok_or(LifecycleError::NotInitialized)?;

        match params.command.as_str() {
            handlers::SHOW_CONFIG_COMMAND => {
                self.client
                    .show_message(MessageType::INFO, workspace.config.raw.clone())
                    .await;
            }
            handlers::SHOW_PROVIDERS_COMMAND => {
                let text = handlers::describe_providers(
                    &self.diagnostics_provider_names(),
                    &self.formatting_provider_names(),
                );
                self.client.show_message(MessageType::INFO, text).await;
            }
            other => return Err(SessionError::UnknownCommand(other.to_string())),
        }
        Ok(())
    }

    /// Stop pending timers. Work already running is allowed to finish.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.lifecycle().shutdown()?;
        log::info!("{} shutting down", handlers::SERVER_NAME);
        if let Some(workspace) = self.workspace.get() {
            workspace.diagnostics.cancel_pending();
            workspace.formatting.cancel_pending();
        }
        Ok(())
    }

    /// Cancel everything, killing in-flight tool processes.
    pub fn exit(&self) {
        let orderly = self.lifecycle().exit();
        if orderly {
            log::info!("Exiting");
        } else {
            log::warn!("Exit received before shutdown");
        }
        if let Some(workspace) = self.workspace.get() {
            workspace.diagnostics.cancel_all();
            workspace.formatting.cancel_all();
        }
        self.root.cancel();
    }
}

/// First workspace folder, else `rootUri`, else the working directory.
fn resolve_root(params: &InitializeParams) -> PathBuf {
    let from_folders = params
        .workspace_folders
        .as_ref()
        .and_then(|folders| folders.first())
        .and_then(|folder| folder.uri.to_file_path().ok());
    #[allow(deprecated)]
    let from_root_uri = params
        .root_uri
        .as_ref()
        .and_then(|uri| uri.to_file_path().ok());

    from_folders
        .or(from_root_uri)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}
