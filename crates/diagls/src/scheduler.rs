//
// scheduler.rs
//
// Debounced, generation-fenced scheduling of per-document work
//

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;

use crate::context::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Diagnostics,
    Formatting,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Diagnostics => f.write_str("diagnostics"),
            OperationKind::Formatting => f.write_str("formatting"),
        }
    }
}

/// What became of one scheduled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The work ran and its result was handed to `publish`
    Published,
    /// A newer schedule for the same document replaced this one
    Superseded,
    /// Stopped by the scheduler being cancelled or shut down
    Cancelled,
}

#[derive(Debug, Default)]
struct State {
    /// Timers that have not fired yet: generation and cancel token
    pending: HashMap<Url, (u64, CancellationToken)>,
    /// Latest generation handed out per document. Entries are never
    /// removed: a fresh counter would hand out generations that a run still
    /// in flight could match.
    generations: HashMap<Url, u64>,
}

#[derive(Debug)]
struct Inner {
    kind: OperationKind,
    delay: Duration,
    root: CancellationToken,
    state: Mutex<State>,
}

/// Coalesces bursts of requests per document and discards results that
/// were overtaken by a newer request.
///
/// Every schedule bumps the document's generation. A result is published
/// only if its generation is still the latest when the work completes, so
/// a slow run started on an old edit can never overwrite a newer one.
/// Superseded work that is already running is not killed; its result is
/// dropped.
#[derive(Debug, Clone)]
pub struct DebouncedScheduler {
    inner: Arc<Inner>,
}

impl DebouncedScheduler {
    pub fn new(kind: OperationKind, delay: Duration) -> Self {
        Self::with_root(kind, delay, CancellationToken::new())
    }

    /// All work contexts derive from `root`; cancelling it stops everything.
    pub fn with_root(kind: OperationKind, delay: Duration, root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                delay,
                root,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_generation(&self, uri: &Url) -> u64 {
        self.state().generations.get(uri).copied().unwrap_or(0)
    }

    pub fn has_pending(&self, uri: &Url) -> bool {
        self.state().pending.contains_key(uri)
    }

    /// Run `work` after the debounce delay, unless rescheduled first, and
    /// hand its output to `publish` if no newer schedule happened meanwhile.
    pub fn schedule<W, WF, T, P, PF>(&self, uri: Url, work: W, publish: P) -> JoinHandle<ScheduleOutcome>
    where
        W: FnOnce(RequestContext) -> WF + Send + 'static,
        WF: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        P: FnOnce(T) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        self.spawn(uri, Some(self.inner.delay), work, publish)
    }

    /// Like [`DebouncedScheduler::schedule`] with no delay. Any pending timer
    /// for the document is cancelled.
    pub fn schedule_priority<W, WF, T, P, PF>(
        &self,
        uri: Url,
        work: W,
        publish: P,
    ) -> JoinHandle<ScheduleOutcome>
    where
        W: FnOnce(RequestContext) -> WF + Send + 'static,
        WF: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        P: FnOnce(T) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        self.spawn(uri, None, work, publish)
    }

    /// Cancel every timer that has not fired yet. Running work is untouched.
    pub fn cancel_pending(&self) {
        let mut state = self.state();
        for (_, (_, token)) in state.pending.drain() {
            token.cancel();
        }
    }

    /// Cancel pending timers and every running operation.
    pub fn cancel_all(&self) {
        self.cancel_pending();
        self.inner.root.cancel();
    }

    /// Bump the generation and replace any pending timer.
    fn arm(&self, uri: &Url) -> (u64, CancellationToken) {
        let mut state = self.state();
        if let Some((_, previous)) = state.pending.remove(uri) {
            previous.cancel();
        }
        let generation = {
            let counter = state.generations.entry(uri.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let token = self.inner.root.child_token();
        state.pending.insert(uri.clone(), (generation, token.clone()));
        (generation, token)
    }

    /// Timer fired: clear our pending entry and report whether we are still current.
    fn fire(&self, uri: &Url, generation: u64) -> bool {
        let mut state = self.state();
        if matches!(state.pending.get(uri), Some((pending, _)) if *pending == generation) {
            state.pending.remove(uri);
        }
        state.generations.get(uri).copied() == Some(generation)
    }

    fn is_current(&self, uri: &Url, generation: u64) -> bool {
        self.current_generation(uri) == generation
    }

    /// Outcome for an operation that stopped before running. It was
    /// superseded only if a newer generation exists.
    fn interrupted(&self, uri: &Url, generation: u64) -> ScheduleOutcome {
        if self.inner.root.is_cancelled() || self.is_current(uri, generation) {
            ScheduleOutcome::Cancelled
        } else {
            ScheduleOutcome::Superseded
        }
    }

    fn spawn<W, WF, T, P, PF>(
        &self,
        uri: Url,
        delay: Option<Duration>,
        work: W,
        publish: P,
    ) -> JoinHandle<ScheduleOutcome>
    where
        W: FnOnce(RequestContext) -> WF + Send + 'static,
        WF: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        P: FnOnce(T) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        let (generation, token) = self.arm(&uri);
        let kind = self.inner.kind;
        log::debug!("Scheduled {kind} for {uri} (generation {generation}, delay {delay:?})");
        let scheduler = self.clone();

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::trace!("{kind} timer for {uri} (generation {generation}) cancelled");
                        return scheduler.interrupted(&uri, generation);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            // a newer schedule may have raced the timer
            if !scheduler.fire(&uri, generation) {
                log::trace!("{kind} for {uri} (generation {generation}) superseded before running");
                return scheduler.interrupted(&uri, generation);
            }

            let output = work(RequestContext::with_token(token)).await;

            if scheduler.inner.root.is_cancelled() {
                return ScheduleOutcome::Cancelled;
            }
            if !scheduler.is_current(&uri, generation) {
                log::trace!(
                    "Dropping {kind} result for {uri}: generation {generation} is stale (current {})",
                    scheduler.current_generation(&uri)
                );
                return ScheduleOutcome::Superseded;
            }

            publish(output).await;
            ScheduleOutcome::Published
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DELAY: Duration = Duration::from_millis(300);

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///project/{name}")).unwrap()
    }

    #[derive(Clone, Default)]
    struct Recorder {
        runs: Arc<AtomicUsize>,
        published: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn schedule(
            &self,
            scheduler: &DebouncedScheduler,
            uri: Url,
            label: &str,
            work_time: Duration,
            priority: bool,
        ) -> JoinHandle<ScheduleOutcome> {
            let runs = self.runs.clone();
            let published = self.published.clone();
            let label = label.to_string();
            let work = move |_ctx: RequestContext| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(work_time).await;
                label
            };
            let publish = move |output: String| async move {
                published.lock().unwrap().push(output);
            };
            if priority {
                scheduler.schedule_priority(uri, work, publish)
            } else {
                scheduler.schedule(uri, work, publish)
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn published(&self) -> Vec<String> {
            self.published.lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_schedules_coalesce() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();
        let doc = uri("a.php");

        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(recorder.schedule(&scheduler, doc.clone(), &format!("edit {i}"), Duration::ZERO, false));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        assert_eq!(&outcomes[..4], &[ScheduleOutcome::Superseded; 4]);
        assert_eq!(outcomes[4], ScheduleOutcome::Published);
        assert_eq!(recorder.runs(), 1);
        assert_eq!(recorder.published(), vec!["edit 4"]);
        assert_eq!(scheduler.current_generation(&doc), 5);
        assert!(!scheduler.has_pending(&doc));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stale_result_is_fenced() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();
        let doc = uri("a.php");

        let slow = recorder.schedule(&scheduler, doc.clone(), "old", Duration::from_secs(5), false);
        // let the first timer fire so its work is running
        tokio::time::sleep(DELAY + Duration::from_millis(10)).await;
        assert_eq!(recorder.runs(), 1);

        let fast = recorder.schedule(&scheduler, doc.clone(), "new", Duration::from_millis(10), false);

        assert_eq!(fast.await.unwrap(), ScheduleOutcome::Published);
        assert_eq!(slow.await.unwrap(), ScheduleOutcome::Superseded);
        assert_eq!(recorder.runs(), 2);
        assert_eq!(recorder.published(), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_replaces_pending_timer() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();
        let doc = uri("a.php");

        let debounced = recorder.schedule(&scheduler, doc.clone(), "change", Duration::ZERO, false);
        let saved = recorder.schedule(&scheduler, doc.clone(), "save", Duration::ZERO, true);

        assert_eq!(saved.await.unwrap(), ScheduleOutcome::Published);
        assert_eq!(debounced.await.unwrap(), ScheduleOutcome::Superseded);
        assert_eq!(recorder.runs(), 1);
        assert_eq!(recorder.published(), vec!["save"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_runs_without_delay() {
        let scheduler = DebouncedScheduler::new(OperationKind::Formatting, Duration::from_secs(60));
        let recorder = Recorder::default();
        let started = tokio::time::Instant::now();

        let handle = recorder.schedule(&scheduler, uri("a.php"), "now", Duration::ZERO, true);
        assert_eq!(handle.await.unwrap(), ScheduleOutcome::Published);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_documents_are_independent() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();

        let a = recorder.schedule(&scheduler, uri("a.php"), "a", Duration::ZERO, false);
        let b = recorder.schedule(&scheduler, uri("b.php"), "b", Duration::ZERO, false);

        assert_eq!(a.await.unwrap(), ScheduleOutcome::Published);
        assert_eq!(b.await.unwrap(), ScheduleOutcome::Published);
        let mut published = recorder.published();
        published.sort();
        assert_eq!(published, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_pending_and_running() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();

        let pending = recorder.schedule(&scheduler, uri("a.php"), "a", Duration::ZERO, false);
        let running = {
            let published = recorder.published.clone();
            scheduler.schedule_priority(
                uri("b.php"),
                |ctx: RequestContext| async move {
                    ctx.done().await;
                    "b".to_string()
                },
                move |output: String| async move {
                    published.lock().unwrap().push(output);
                },
            )
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.cancel_all();
        assert_eq!(pending.await.unwrap(), ScheduleOutcome::Cancelled);
        assert_eq!(running.await.unwrap(), ScheduleOutcome::Cancelled);
        assert_eq!(recorder.runs(), 0);
        assert!(recorder.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_leaves_running_work() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();
        let doc = uri("a.php");

        let running = recorder.schedule(&scheduler, doc.clone(), "a", Duration::from_secs(1), true);
        let pending = recorder.schedule(&scheduler, uri("b.php"), "b", Duration::ZERO, false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.cancel_pending();
        assert_eq!(pending.await.unwrap(), ScheduleOutcome::Cancelled);
        assert_eq!(running.await.unwrap(), ScheduleOutcome::Published);
        assert_eq!(recorder.published(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_survives_completed_work() {
        let scheduler = DebouncedScheduler::new(OperationKind::Diagnostics, DELAY);
        let recorder = Recorder::default();
        let doc = uri("a.php");

        let first = recorder.schedule(&scheduler, doc.clone(), "first", Duration::ZERO, true);
        assert_eq!(first.await.unwrap(), ScheduleOutcome::Published);
        assert_eq!(scheduler.current_generation(&doc), 1);

        let second = recorder.schedule(&scheduler, doc.clone(), "second", Duration::ZERO, true);
        assert_eq!(second.await.unwrap(), ScheduleOutcome::Published);
        assert_eq!(scheduler.current_generation(&doc), 2);
        assert_eq!(recorder.published(), vec!["first", "second"]);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(OperationKind::Diagnostics.to_string(), "diagnostics");
        assert_eq!(OperationKind::Formatting.to_string(), "formatting");
    }
}
