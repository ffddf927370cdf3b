//
// backend.rs
//
// tower-lsp adapter around the session
//

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc;
use tower::Service;
use tower_lsp::jsonrpc::{self, ErrorCode, Request, Response, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};

use crate::gateway::{CommandRunner, DockerRunner};
use crate::session::{Session, SessionError};

pub struct Backend {
    session: Arc<Session>,
    /// Errors that must stop the server, forwarded to `start_lsp`
    fatal: mpsc::UnboundedSender<SessionError>,
}

impl Backend {
    pub fn new(
        client: Client,
        runner: Arc<dyn CommandRunner>,
        fatal: mpsc::UnboundedSender<SessionError>,
    ) -> Self {
        Self {
            session: Arc::new(Session::new(Arc::new(client), runner)),
            fatal,
        }
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }
}

fn rpc_error(error: &SessionError) -> jsonrpc::Error {
    match error {
        SessionError::ConfigMissing(_) => jsonrpc::Error {
            code: ErrorCode::InternalError,
            message: error.to_string().into(),
            data: None,
        },
        SessionError::Lifecycle(_) => jsonrpc::Error {
            code: ErrorCode::InvalidRequest,
            message: error.to_string().into(),
            data: None,
        },
        SessionError::UnknownCommand(_) => jsonrpc::Error::invalid_params(error.to_string()),
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        match self.session.initialize(params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let reply = rpc_error(&e);
                if e.is_fatal() && self.fatal.send(e).is_err() {
                    log::error!("Fatal error channel closed");
                }
                Err(reply)
            }
        }
    }

    async fn initialized(&self, _: InitializedParams) {
        self.session.initialized();
    }

    async fn shutdown(&self) -> Result<()> {
        self.session.shutdown().map_err(|e| rpc_error(&e))
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        self.session.did_open(params);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        self.session.did_change(params);
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        self.session.did_save(params);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        self.session.did_close(params);
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        self.session.did_change_watched_files(params);
    }

    async fn formatting(&self, params: DocumentFormattingParams) -> Result<Option<Vec<TextEdit>>> {
        Ok(Some(self.session.formatting(params).await))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        self.session
            .execute_command(params)
            .await
            .map(|()| None)
            .map_err(|e| rpc_error(&e))
    }
}

type ResponseFuture<E> = Pin<Box<dyn Future<Output = std::result::Result<Option<Response>, E>> + Send>>;

/// Outer service around [`LspService`].
///
/// Requests for methods the server does not implement get an empty success
/// reply instead of `MethodNotFound`. `exit` tears down the session before
/// tower-lsp closes the connection.
pub struct LifecycleService<S> {
    inner: S,
    session: Arc<Session>,
}

impl<S> LifecycleService<S> {
    pub fn new(inner: S, session: Arc<Session>) -> Self {
        Self { inner, session }
    }
}

impl<S> Service<Request> for LifecycleService<S>
where
    S: Service<Request, Response = Option<Response>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Option<Response>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        match request.method() {
            "$/cancelRequest" => {
                log::debug!("Client cancelled request {:?}", request.params());
            }
            "exit" => self.session.exit(),
            _ => {}
        }

        let method = request.method().to_string();
        let future = self.inner.call(request);
        Box::pin(async move {
            let response = future.await?;
            Ok(response.map(|response| acknowledge_unknown_method(&method, response)))
        })
    }
}

fn acknowledge_unknown_method(method: &str, response: Response) -> Response {
    match response.error() {
        Some(error) if error.code == ErrorCode::MethodNotFound => {
            log::debug!("Acknowledging unhandled method {method}");
            Response::from_ok(response.id().clone(), Value::Null)
        }
        _ => response,
    }
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let runner: Arc<dyn CommandRunner> = Arc::new(DockerRunner::new());
    let (service, socket) = LspService::new(move |client| Backend::new(client, runner, fatal_tx));
    let session = service.inner().session();
    let service = LifecycleService::new(service, session);

    tokio::select! {
        _ = Server::new(stdin, stdout, socket).serve(service) => Ok(()),
        Some(error) = fatal_rx.recv() => {
            log::error!("Stopping: {error}");
            Err(error.into())
        }
    }
}
