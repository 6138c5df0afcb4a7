//! Pipeline
//!
//! The controller sequencing the stages for one request, its state machine
//! and the request/response envelopes.

pub mod controller;
pub mod envelope;
pub mod state;

pub use controller::{PipelineController, PipelineDeps, MAX_GENERATIONS};
pub use envelope::{error_kind, error_reason, PipelineFailure, PipelineRequest, PipelineResponse};
pub use state::{PipelineState, Stage, StateTrace};
