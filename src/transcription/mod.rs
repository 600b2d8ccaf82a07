//! # Transcription Module
//!
//! Everything between a denoised clip and the text sent back to the client.
//!
//! ## Key Components:
//! - **Registry**: region key → model descriptor table
//! - **Model**: candle Whisper encoder/decoder behind the `SpeechModel` seam
//! - **Handler**: one model plus the strategy that drives it
//! - **Orchestrator**: denoise once, fan out to base and region models, aggregate

pub mod handler; // Strategy selection and failure isolation
pub mod mel; // Log-mel filterbank
pub mod model; // Whisper loading and greedy decoding
pub mod orchestrator; // Per-request pipeline
pub mod registry; // Region table

pub use handler::{HandlerStatus, ModelHandler, TranscriptionStrategy};
pub use orchestrator::{AggregatedResult, DenoisedClip, TranscriptionPipeline};
pub use registry::{ModelDescriptor, ModelRegistry};
