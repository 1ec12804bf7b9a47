//! Error taxonomy for the session core.
//!
//! Resource errors tear the partially built session down; tokenization and
//! decode errors abort the current turn but leave the session usable; usage
//! errors surface immediately instead of degrading silently.

use thiserror::Error;

use crate::bitmap::StageError;
use crate::runtime::RuntimeError;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    // Resource errors: always reported, never retried, always followed by
    // full cleanup of the partially constructed session.
    #[error("language model load failed: {0}")]
    LanguageLoad(RuntimeError),

    #[error("vision projector load failed: {0}")]
    VisionLoad(RuntimeError),

    #[error("decoding context init failed: {0}")]
    ContextInit(RuntimeError),

    #[error("sampler init failed: {0}")]
    SamplerInit(RuntimeError),

    #[error("chat template init failed: {0}")]
    TemplateInit(String),

    #[error("unknown chat template '{0}'")]
    UnknownTemplate(String),

    // Turn-scoped errors: the session itself stays usable afterwards.
    #[error("prompt rendering failed: {0}")]
    TemplateRender(#[from] minijinja::Error),

    #[error("tokenization failed: {0}")]
    Tokenize(RuntimeError),

    #[error("prompt evaluation failed: {0}")]
    Eval(RuntimeError),

    #[error("token decode failed: {0}")]
    Decode(RuntimeError),

    #[error("context window exhausted: {needed} more tokens do not fit ({used} of {capacity} used)")]
    ContextOverflow {
        needed: usize,
        used: usize,
        capacity: usize,
    },

    #[error("image staging failed: {0}")]
    Stage(#[from] StageError),

    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),

    // Usage errors.
    #[error("session is not ready: {0}")]
    NotReady(&'static str),

    #[error("initialization step out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("config load failed: {0}")]
    Config(String),

    #[error("failed to spawn session worker: {0}")]
    WorkerSpawn(std::io::Error),

    #[error("session worker is gone")]
    WorkerGone,
}
