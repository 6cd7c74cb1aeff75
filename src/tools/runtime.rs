//! Helpers for running blocking work inside the tokio runtime.

/// Run a blocking closure from async context without starving the
/// executor. Must run on a multi-threaded runtime worker.
pub fn block_in_place<R>(f: impl FnOnce() -> R) -> R {
    tokio::task::block_in_place(f)
}
