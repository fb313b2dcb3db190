//! Watch lifecycle controller.
//!
//! Owns one poll session per watch and turns its callbacks into events for presentation layers.

use crate::model::PollEvent;
use crate::poller::{PollOptions, Poller};
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

#[derive(Debug, Clone)]
pub(crate) struct WatchConfig {
    pub interval: Duration,
    /// Upper bound for the error backoff. `None` keeps the interval fixed.
    pub max_interval: Option<Duration>,
}

/// How a watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchEnd {
    /// The session reached `completed` or `failed` and shut itself down.
    Settled,
    /// The shutdown future fired first and the session was stopped.
    Interrupted,
}

/// Build poll options that forward every callback to `event_tx`.
///
/// With `max_interval` set, each failed fetch doubles the delay up to that bound and the
/// next successful fetch restores the configured interval.
fn watch_options(cfg: &WatchConfig, event_tx: UnboundedSender<PollEvent>) -> PollOptions {
    let options = PollOptions::new().interval(cfg.interval);
    let control = options.interval_control();
    let reset = control.clone();
    let base = cfg.interval;
    let max_interval = cfg.max_interval;
    let update_tx = event_tx.clone();
    let terminal_tx = event_tx.clone();

    options
        .on_update(move |record| {
            if max_interval.is_some() {
                reset.set(base);
            }
            let _ = update_tx.send(PollEvent::Update(record.clone()));
        })
        .on_terminal(move |record| {
            let _ = terminal_tx.send(PollEvent::Terminal(record));
        })
        .on_error(move |err| {
            if let Some(max) = max_interval {
                control.set((control.get() * 2).min(max.max(base)));
            }
            let _ = event_tx.send(PollEvent::Error(err.to_string()));
        })
}

/// Watch one analysis until it settles or `shutdown` resolves.
///
/// Events stop arriving, and the channel closes, once this returns.
pub(crate) async fn run_watch<S>(
    poller: Poller,
    analysis_id: String,
    cfg: WatchConfig,
    event_tx: UnboundedSender<PollEvent>,
    shutdown: S,
) -> Result<WatchEnd>
where
    S: Future<Output = ()>,
{
    let mut handle = poller.start(&analysis_id, watch_options(&cfg, event_tx))?;
    info!(analysis_id = %handle.analysis_id(), interval = ?cfg.interval, "watching analysis");

    tokio::pin!(shutdown);
    let interrupted = tokio::select! {
        _ = handle.finished() => false,
        _ = &mut shutdown => true,
    };

    if interrupted {
        if handle.is_active() {
            handle.stop();
            handle.finished().await;
            info!(analysis_id = %analysis_id, "watch interrupted");
            return Ok(WatchEnd::Interrupted);
        }
        // terminal status landed together with the shutdown request
        handle.finished().await;
    }
    Ok(WatchEnd::Settled)
}
