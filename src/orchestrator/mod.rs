//! Application-level orchestration utilities.
//!
//! This module owns the watch lifecycle (start, interrupt, teardown of the poll session)
//! and the work done once an analysis settles, such as fetching its report. CLI code calls
//! into this module so presentation stays separate from polling.

mod controller;
mod post_process;

pub(crate) use controller::{run_watch, WatchConfig, WatchEnd};
pub(crate) use post_process::{process_terminal, resolve_download_path};
