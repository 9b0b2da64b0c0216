//! CleanSight core: real-time per-client video inference pipelines.
//!
//! Each client session runs an isolated worker chain over bounded
//! drop-oldest queues: capture (connect, retry, pace) → inference (task
//! plan over a shared worker pool) → delivery (wire serialization and
//! per-subscriber fan-out) and segment recording. The [`Pipeline`] manager
//! owns the shared task registry, inference pool, and status board; no
//! process-wide state.

pub mod capture;
pub mod config;
pub mod delivery;
pub mod error;
pub mod frame;
pub mod inference;
pub mod queues;
pub mod recorder;
pub mod session;
pub mod sim;
pub mod source;
pub mod status;
pub mod tasks;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use session::{Pipeline, SessionState};
