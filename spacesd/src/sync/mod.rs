pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod index;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod reconciler;
pub mod transfer;
