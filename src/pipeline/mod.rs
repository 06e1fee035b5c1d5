//! Streaming post-processing between the agent and the client.
//!
//! - [`delta`]: cumulative snapshots to incremental deltas
//! - [`normalizer`]: raw agent events to [`crate::normalized::StreamEvent`]s
//! - [`repair`]: end-of-stream URL repair

pub mod delta;
pub mod normalizer;
pub mod repair;

pub use delta::{DeltaError, DeltaTracker};
pub use normalizer::{NormalizerOptions, StreamState, ToolSurfacing, normalize};
pub use repair::{PROJECT_LINKS_HEADING, Repair, repair};
