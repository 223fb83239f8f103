//! Download module
//!
//! Coordinates a download across many peers: piece selection, per-peer
//! sessions, verification and progress.

pub mod manager;
pub mod picker;
pub mod progress;
mod session;
mod swarm;

pub use manager::{DownloadManager, DownloadOutcome};
pub use picker::{PiecePicker, PieceSelectionStrategy};
pub(crate) use swarm::wait_for_flag;
pub use progress::{ProgressCallback, ProgressReport, ProgressTracker};
