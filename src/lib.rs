//! Stateful session manager for local vision-language models.
//!
//! The crate drives a multimodal model runtime through multi-turn,
//! streaming chat: staged images and a text prompt are rendered through a
//! chat template, tokenized into mixed text/image chunks, evaluated
//! incrementally against a fixed context window, and the sampled tokens
//! stream back to the caller in order until an end-of-generation token,
//! an antiprompt match, or the token budget ends the turn.
//!
//! The model runtime itself (weights, vision encoder, attention, sampling
//! distributions) is a collaborator behind the [`ModelRuntime`] trait; the
//! session owns its opaque handles and enforces their creation and
//! teardown order. Cross-thread use goes through [`SessionHandle`], which
//! serializes all traffic onto one worker and guarantees in-order
//! fragments with exactly one completion per call.

mod bitmap;
mod config;
mod error;
mod images;
mod runtime;
mod session;
mod stream;
mod template;

pub use bitmap::{stage_from_buffer, Bitmap, PendingImageQueue, PixelLayout, StageError};
pub use config::{clamp_threads, SessionConfig};
pub use error::{Result, SessionError};
pub use images::load_bitmap;
pub use runtime::{
    BatchEntry, Chunk, DecodeBatch, ModelRuntime, RuntimeError, TokenId, TokenizeRequest,
    SEQ_PRIMARY,
};
pub use session::{InitStage, SessionManager};
pub use stream::SessionHandle;
pub use template::{ChatMessage, ChatTemplates, IMAGE_MARKER};
