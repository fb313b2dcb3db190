//! Analysis status poller.
//!
//! Turns a one-shot "fetch the current record" call into a managed polling session:
//! the next fetch is only issued `interval` after the previous one resolved, a terminal
//! status ends the session on its own, and `stop()` silences the session, including a
//! fetch that is already in flight.

use crate::error::{FetchError, PollError};
use crate::model::AnalysisRecord;
use futures::future::BoxFuture;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2000);

/// Source of analysis records. Implemented by the HTTP client and by test fakes.
pub trait RecordFetcher: Send + Sync {
    fn fetch_record<'a>(
        &'a self,
        analysis_id: &'a str,
    ) -> BoxFuture<'a, Result<AnalysisRecord, FetchError>>;
}

/// Delay between the end of one fetch and the start of the next.
///
/// Cloneable and shared with the running session, so callbacks can adjust it (for
/// example to back off inside `on_error`); the next scheduled delay picks up the change.
#[derive(Debug, Clone)]
pub struct PollInterval(Arc<AtomicU64>);

impl PollInterval {
    fn new(interval: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(duration_ms(interval))))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    /// Update the delay. Values below one millisecond are raised to one.
    pub fn set(&self, interval: Duration) {
        self.0.store(duration_ms(interval).max(1), Ordering::Relaxed);
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

type UpdateFn = Box<dyn FnMut(&AnalysisRecord) + Send>;
type TerminalFn = Box<dyn FnOnce(AnalysisRecord) + Send>;
type ErrorFn = Box<dyn FnMut(&FetchError) + Send>;

/// Settings and callbacks for one session.
pub struct PollOptions {
    interval: PollInterval,
    on_update: Option<UpdateFn>,
    on_terminal: Option<TerminalFn>,
    on_error: Option<ErrorFn>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: PollInterval::new(DEFAULT_INTERVAL),
            on_update: None,
            on_terminal: None,
            on_error: None,
        }
    }
}

impl PollOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(self, interval: Duration) -> Self {
        self.interval.0.store(duration_ms(interval), Ordering::Relaxed);
        self
    }

    /// Shared handle on the session's interval, for use inside callbacks.
    pub fn interval_control(&self) -> PollInterval {
        self.interval.clone()
    }

    /// Called after every successful fetch, including the first and the terminal one.
    pub fn on_update(mut self, f: impl FnMut(&AnalysisRecord) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    /// Called once, when the status first becomes `completed` or `failed`.
    pub fn on_terminal(mut self, f: impl FnOnce(AnalysisRecord) + Send + 'static) -> Self {
        self.on_terminal = Some(Box::new(f));
        self
    }

    /// Called on every failed fetch. Polling continues afterwards.
    pub fn on_error(mut self, f: impl FnMut(&FetchError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// State shared between a session task and its handle.
struct Session {
    analysis_id: String,
    active: AtomicBool,
    wake: Notify,
    interval: PollInterval,
}

impl Session {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns true if this call is the one that ended the session.
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Starts polling sessions against a shared fetcher.
#[derive(Clone)]
pub struct Poller {
    fetcher: Arc<dyn RecordFetcher>,
}

impl Poller {
    pub fn new(fetcher: Arc<dyn RecordFetcher>) -> Self {
        Self { fetcher }
    }

    /// Start watching `analysis_id`. The first fetch is issued right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, analysis_id: &str, options: PollOptions) -> Result<PollHandle, PollError> {
        let analysis_id = analysis_id.trim();
        if analysis_id.is_empty() {
            return Err(PollError::InvalidArgument("analysis id must not be empty"));
        }
        if options.interval.get().is_zero() {
            return Err(PollError::InvalidArgument("poll interval must be positive"));
        }

        let session = Arc::new(Session {
            analysis_id: analysis_id.to_string(),
            active: AtomicBool::new(true),
            wake: Notify::new(),
            interval: options.interval.clone(),
        });

        let span = tracing::debug_span!("poll", analysis_id = %session.analysis_id);
        let task = tokio::spawn(
            run_session(self.fetcher.clone(), session.clone(), options).instrument(span),
        );

        Ok(PollHandle {
            session,
            task: Some(task),
        })
    }
}

async fn run_session(fetcher: Arc<dyn RecordFetcher>, session: Arc<Session>, options: PollOptions) {
    let PollOptions {
        on_update: mut update_cb,
        on_terminal: mut terminal_cb,
        on_error: mut error_cb,
        ..
    } = options;
    let mut fetches = 0u64;

    while session.is_active() {
        fetches += 1;
        trace!(fetch = fetches, "fetching record");

        let outcome = tokio::select! {
            biased;
            _ = session.wake.notified() => {
                trace!(fetch = fetches, "stopped with fetch in flight, dropping it");
                break;
            }
            res = fetcher.fetch_record(&session.analysis_id) => res,
        };

        if !session.is_active() {
            trace!(fetch = fetches, "session inactive at resolution, discarding result");
            break;
        }

        match outcome {
            Ok(record) => {
                debug!(fetch = fetches, status = %record.status, "status update");
                if let Some(cb) = update_cb.as_mut() {
                    cb(&record);
                }
                if record.status.is_terminal() {
                    // on_update may already have stopped us
                    if session.deactivate() {
                        debug!(status = %record.status, "terminal status reached");
                        if let Some(cb) = terminal_cb.take() {
                            cb(record);
                        }
                    }
                    break;
                }
            }
            Err(err) => {
                debug!(fetch = fetches, error = %err, "fetch failed, will retry");
                if let Some(cb) = error_cb.as_mut() {
                    cb(&err);
                }
            }
        }

        if !session.is_active() {
            break;
        }

        let delay = session.interval.get();
        tokio::select! {
            biased;
            _ = session.wake.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    trace!(fetches, "poll session finished");
}

/// Owner of a running session. Dropping it stops the session.
pub struct PollHandle {
    session: Arc<Session>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn analysis_id(&self) -> &str {
        &self.session.analysis_id
    }

    /// False once stopped or once a terminal status has been delivered.
    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Stop polling. Idempotent.
    ///
    /// Once the session task observes the stop, no further fetch result is delivered and no
    /// fetch is issued. Called from another thread, it does not wait for a callback that the
    /// session task has already entered; await `finished()` for that.
    pub fn stop(&self) {
        if self.session.deactivate() {
            debug!(analysis_id = %self.session.analysis_id, "poll session stopped");
            self.session.wake.notify_one();
        }
    }

    /// Wait for the session task to end (terminal status or `stop()`).
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                warn!(analysis_id = %self.session.analysis_id, "poll session task failed: {e}");
            }
            self.task = None;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalysisStatus;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct Step {
        latency: Duration,
        result: Result<AnalysisRecord, FetchError>,
    }

    fn ok(status: &str) -> Step {
        Step {
            latency: Duration::ZERO,
            result: Ok(AnalysisRecord::new("a1", status)),
        }
    }

    fn fail() -> Step {
        Step {
            latency: Duration::ZERO,
            result: Err(FetchError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                detail: "try later".into(),
            }),
        }
    }

    fn slow(step: Step, latency: Duration) -> Step {
        Step { latency, ..step }
    }

    #[derive(Debug, Clone, Copy)]
    struct FetchSpan {
        issued: Instant,
        resolved: Instant,
    }

    /// Plays back a fixed script; once exhausted it keeps answering "processing".
    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Step>>,
        issued: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        spans: Mutex<Vec<FetchSpan>>,
    }

    impl ScriptedFetcher {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                ..Default::default()
            })
        }

        fn issued(&self) -> usize {
            self.issued.load(Ordering::SeqCst)
        }

        fn spans(&self) -> Vec<FetchSpan> {
            self.spans.lock().unwrap().clone()
        }
    }

    impl RecordFetcher for ScriptedFetcher {
        fn fetch_record<'a>(
            &'a self,
            analysis_id: &'a str,
        ) -> BoxFuture<'a, Result<AnalysisRecord, FetchError>> {
            Box::pin(async move {
                let issued = Instant::now();
                self.issued.fetch_add(1, Ordering::SeqCst);
                let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

                let step = self.script.lock().unwrap().pop_front();
                let step = step.unwrap_or_else(|| ok("processing"));
                if !step.latency.is_zero() {
                    tokio::time::sleep(step.latency).await;
                }

                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.spans.lock().unwrap().push(FetchSpan {
                    issued,
                    resolved: Instant::now(),
                });
                step.result.map(|mut r| {
                    r.id = analysis_id.to_string();
                    r
                })
            })
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        updates: Arc<Mutex<Vec<(Instant, AnalysisRecord)>>>,
        terminals: Arc<Mutex<Vec<(Instant, AnalysisRecord)>>>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn options(&self, interval: Duration) -> PollOptions {
            let updates = self.updates.clone();
            let terminals = self.terminals.clone();
            let errors = self.errors.clone();
            PollOptions::new()
                .interval(interval)
                .on_update(move |r| updates.lock().unwrap().push((Instant::now(), r.clone())))
                .on_terminal(move |r| terminals.lock().unwrap().push((Instant::now(), r)))
                .on_error(move |e| errors.lock().unwrap().push(e.to_string()))
        }

        fn update_statuses(&self) -> Vec<String> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|(_, r)| r.status.to_string())
                .collect()
        }

        fn terminal_count(&self) -> usize {
            self.terminals.lock().unwrap().len()
        }

        fn error_count(&self) -> usize {
            self.errors.lock().unwrap().len()
        }

        fn callback_count(&self) -> usize {
            self.updates.lock().unwrap().len() + self.terminal_count() + self.error_count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_processing_completed_scenario() {
        let completed = Step {
            latency: Duration::ZERO,
            result: Ok(AnalysisRecord::new("a1", "completed")
                .with_field("total_reviews", 100)
                .with_field("flagged_reviews", 12)),
        };
        let fetcher = ScriptedFetcher::new(vec![ok("queued"), ok("processing"), completed]);
        let rec = Recorder::default();
        let t0 = Instant::now();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(1000)))
            .unwrap();
        handle.finished().await;

        assert_eq!(rec.update_statuses(), ["queued", "processing", "completed"]);
        let offsets: Vec<u128> = rec
            .updates
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.duration_since(t0).as_millis())
            .collect();
        assert_eq!(offsets, [0, 1000, 2000]);

        let terminals = rec.terminals.lock().unwrap().clone();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].0.duration_since(t0).as_millis(), 2000);
        assert_eq!(terminals[0].1.status, AnalysisStatus::Completed);
        assert_eq!(terminals[0].1.flagged_reviews(), Some(12));
        assert!(!handle.is_active());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fetcher.issued(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_fetch_in_flight() {
        let latencies = [2500, 10, 4000, 0, 1200, 3100];
        let mut steps: Vec<Step> = latencies
            .iter()
            .map(|ms| slow(ok("processing"), Duration::from_millis(*ms)))
            .collect();
        steps.insert(3, slow(fail(), Duration::from_millis(1700)));
        steps.push(slow(ok("completed"), Duration::from_millis(900)));
        let fetcher = ScriptedFetcher::new(steps);
        let rec = Recorder::default();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(500)))
            .unwrap();
        handle.finished().await;

        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.issued(), 8);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_measured_from_resolution_for_success_and_error() {
        let interval = Duration::from_millis(750);
        let fetcher = ScriptedFetcher::new(vec![
            slow(ok("queued"), Duration::from_millis(300)),
            slow(fail(), Duration::from_millis(2000)),
            fail(),
            slow(ok("extracting"), Duration::from_millis(50)),
            ok("failed"),
        ]);
        let rec = Recorder::default();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(interval))
            .unwrap();
        handle.finished().await;

        let spans = fetcher.spans();
        assert_eq!(spans.len(), 5);
        for pair in spans.windows(2) {
            let gap = pair[1].issued.duration_since(pair[0].resolved);
            assert!(gap >= interval, "gap {gap:?} shorter than {interval:?}");
        }
        assert_eq!(rec.error_count(), 2);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_in_flight_fetch_suppresses_all_callbacks() {
        let fetcher = ScriptedFetcher::new(vec![slow(ok("completed"), Duration::from_secs(5))]);
        let rec = Recorder::default();

        let handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(1000)))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fetcher.issued(), 1);

        handle.stop();
        assert!(!handle.is_active());
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(rec.callback_count(), 0);
        assert_eq!(fetcher.issued(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_from_another_thread_then_finished_silences_the_session() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let rec = Recorder::default();

        let handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(1)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let handle_stop = tokio::task::spawn_blocking(move || {
            handle.stop();
            handle
        });
        let mut handle = handle_stop.await.unwrap();
        handle.finished().await;
        assert!(!handle.is_active());

        let callbacks = rec.callback_count();
        let issued = fetcher.issued();
        assert!(callbacks >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.callback_count(), callbacks);
        assert_eq!(fetcher.issued(), issued);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_waiting_cancels_the_next_fetch() {
        let fetcher = ScriptedFetcher::new(vec![ok("queued")]);
        let rec = Recorder::default();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_secs(2)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rec.update_statuses(), ["queued"]);

        handle.stop();
        handle.stop();
        handle.finished().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fetcher.issued(), 1);
        assert_eq!(rec.callback_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_reported_and_polling_continues() {
        let fetcher = ScriptedFetcher::new(vec![fail(), fail(), ok("completed")]);
        let rec = Recorder::default();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(100)))
            .unwrap();
        handle.finished().await;

        assert_eq!(rec.error_count(), 2);
        assert!(rec.errors.lock().unwrap()[0].contains("try later"));
        assert_eq!(rec.update_statuses(), ["completed"]);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognised_statuses_keep_polling() {
        let fetcher = ScriptedFetcher::new(vec![
            ok("extracting"),
            ok("reticulating"),
            ok("processing"),
            ok("validating"),
            ok("completed"),
        ]);
        let rec = Recorder::default();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(100)))
            .unwrap();
        handle.finished().await;

        assert_eq!(
            rec.update_statuses(),
            ["extracting", "reticulating", "processing", "validating", "completed"]
        );
        assert_eq!(rec.error_count(), 0);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_is_terminal_and_later_stop_is_a_noop() {
        let fetcher = ScriptedFetcher::new(vec![ok("processing"), ok("failed"), ok("completed")]);
        let rec = Recorder::default();

        let mut handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(100)))
            .unwrap();
        handle.finished().await;
        handle.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fetcher.issued(), 2);
        let terminals = rec.terminals.lock().unwrap().clone();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].1.status, AnalysisStatus::Failed);
    }

    #[test]
    fn empty_identifier_is_rejected_without_a_session() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let poller = Poller::new(fetcher.clone());

        for id in ["", "   "] {
            let err = poller.start(id, PollOptions::new()).err();
            assert_eq!(
                err,
                Some(PollError::InvalidArgument("analysis id must not be empty"))
            );
        }
        assert_eq!(fetcher.issued(), 0);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let err = Poller::new(fetcher)
            .start("a1", PollOptions::new().interval(Duration::ZERO))
            .err();
        assert_eq!(
            err,
            Some(PollError::InvalidArgument("poll interval must be positive"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_session() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let rec = Recorder::default();

        let handle = Poller::new(fetcher.clone())
            .start("a1", rec.options(Duration::from_millis(500)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let seen = fetcher.issued();
        assert_eq!(seen, 3);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetcher.issued(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn on_error_can_back_off_through_the_interval_control() {
        let fetcher = ScriptedFetcher::new(vec![fail(), fail(), ok("completed")]);
        let options = PollOptions::new().interval(Duration::from_millis(100));
        let control = options.interval_control();
        let observed = control.clone();
        let options = options.on_error(move |_| control.set(control.get() * 2));

        let mut handle = Poller::new(fetcher.clone()).start("a1", options).unwrap();
        handle.finished().await;

        let spans = fetcher.spans();
        assert_eq!(spans.len(), 3);
        assert!(spans[1].issued.duration_since(spans[0].resolved) >= Duration::from_millis(200));
        assert!(spans[2].issued.duration_since(spans[1].resolved) >= Duration::from_millis(400));
        assert_eq!(observed.get(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_on_update_suppresses_on_terminal() {
        let fetcher = ScriptedFetcher::new(vec![ok("completed")]);
        let slot: Arc<Mutex<Option<PollHandle>>> = Arc::new(Mutex::new(None));
        let terminal_fired = Arc::new(AtomicBool::new(false));

        let stopper = slot.clone();
        let fired = terminal_fired.clone();
        let options = PollOptions::new()
            .on_update(move |_| {
                if let Some(h) = stopper.lock().unwrap().as_ref() {
                    h.stop();
                }
            })
            .on_terminal(move |_| fired.store(true, Ordering::SeqCst));

        let handle = Poller::new(fetcher.clone()).start("a1", options).unwrap();
        *slot.lock().unwrap() = Some(handle);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!terminal_fired.load(Ordering::SeqCst));
        let handle = slot.lock().unwrap().take();
        assert!(handle.is_some_and(|h| !h.is_active()));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_for_different_ids_are_independent() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let poller = Poller::new(fetcher.clone());
        let first = Recorder::default();
        let second = Recorder::default();

        let h1 = poller.start("a1", first.options(Duration::from_millis(1000))).unwrap();
        let h2 = poller.start("b2", second.options(Duration::from_millis(1000))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h1.stop();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(first.updates.lock().unwrap().len(), 1);
        assert_eq!(second.updates.lock().unwrap().len(), 3);
        assert!(second.updates.lock().unwrap().iter().all(|(_, r)| r.id == "b2"));
        assert!(h2.is_active());
        assert_eq!(h2.analysis_id(), "b2");
    }
}
