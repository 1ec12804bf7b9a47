//! Boundary to the model runtime.
//!
//! Everything behind [`ModelRuntime`] — weight loading, the vision encoder,
//! attention, sampling distributions — is an external collaborator. The
//! session manager only drives this interface; it never looks inside the
//! opaque handle types.

use std::path::Path;

use thiserror::Error;

use crate::bitmap::Bitmap;

#[cfg(test)]
pub(crate) mod stub;

/// Vocabulary token id.
pub type TokenId = u32;

/// The single sequence id this session decodes into.
pub const SEQ_PRIMARY: i32 = 0;

/// Failures reported by the runtime binding.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("file not found or unreadable: {0}")]
    FileNotFound(String),

    #[error("incompatible model format: {0}")]
    IncompatibleFormat(String),

    #[error("resource exhaustion: {0}")]
    ResourceExhausted(String),

    #[error("tokenizer rejected input (code {0})")]
    Tokenize(i32),

    #[error("piece buffer too small, need {needed} bytes")]
    PieceBufferTooSmall { needed: usize },

    #[error("runtime internal error: {0}")]
    Internal(String),
}

/// A tokenizer-produced unit: either a run of text tokens or an embedded
/// image reference that occupies a known number of positions.
#[derive(Debug, Clone)]
pub enum Chunk {
    Text { tokens: Vec<TokenId> },
    Image { embed_tokens: usize },
}

impl Chunk {
    /// Number of KV-cache positions this chunk occupies once evaluated.
    pub fn token_count(&self) -> usize {
        match self {
            Chunk::Text { tokens } => tokens.len(),
            Chunk::Image { embed_tokens } => *embed_tokens,
        }
    }
}

/// Text input handed to the multimodal tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct TokenizeRequest<'a> {
    pub text: &'a str,
    /// Insert the beginning-of-sequence token (first turn only).
    pub add_special: bool,
    /// Parse special/control tokens embedded in the text.
    pub parse_special: bool,
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: u32,
    pub seq_ids: Vec<i32>,
    pub logits: bool,
}

/// Fixed-capacity, reusable buffer of decode entries.
///
/// Cleared and refilled every decode step. Exceeding the capacity is a
/// programmer error and fails loud rather than corrupting the step.
#[derive(Debug)]
pub struct DecodeBatch {
    capacity: usize,
    entries: Vec<BatchEntry>,
}

impl DecodeBatch {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "decode batch capacity must be non-zero");
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, token: TokenId, pos: u32, seq_ids: &[i32], logits: bool) {
        assert!(
            self.entries.len() < self.capacity,
            "decode batch overflow: capacity {} exceeded",
            self.capacity
        );
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_ids: seq_ids.to_vec(),
            logits,
        });
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

/// The model runtime binding consumed by the session manager.
///
/// Handle types are opaque to the core. Creation order is model → vision →
/// context → sampler; the session tears them down in reverse. Any failed
/// call is a hard stop for the operation that issued it.
pub trait ModelRuntime {
    type Model;
    type VisionContext;
    type Context;
    type Sampler;

    fn load_language_model(&self, path: &Path) -> Result<Self::Model, RuntimeError>;

    fn load_vision_projector(
        &self,
        path: &Path,
        model: &Self::Model,
    ) -> Result<Self::VisionContext, RuntimeError>;

    fn create_context(
        &self,
        model: &Self::Model,
        max_context: usize,
        n_threads: usize,
    ) -> Result<Self::Context, RuntimeError>;

    fn create_sampler(
        &self,
        model: &Self::Model,
        temperature: f32,
        seed: u64,
    ) -> Result<Self::Sampler, RuntimeError>;

    /// Tokenize a rendered prompt together with its staged images.
    fn tokenize(
        &self,
        vision: &Self::VisionContext,
        request: TokenizeRequest<'_>,
        images: &[Bitmap],
    ) -> Result<Vec<Chunk>, RuntimeError>;

    /// Text-only tokenization against the model vocabulary (used to derive
    /// antiprompt token sequences from template stop strings).
    fn tokenize_text(
        &self,
        model: &Self::Model,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, RuntimeError>;

    /// Evaluate prompt chunks incrementally starting at `n_past`, returning
    /// the new position count on success.
    #[allow(clippy::too_many_arguments)]
    fn eval_chunks(
        &self,
        vision: &Self::VisionContext,
        context: &mut Self::Context,
        chunks: &[Chunk],
        n_past: u32,
        seq_id: i32,
        batch_capacity: usize,
        logits_last: bool,
    ) -> Result<u32, RuntimeError>;

    fn decode(&self, context: &mut Self::Context, batch: &DecodeBatch) -> Result<(), RuntimeError>;

    fn sample(&self, sampler: &mut Self::Sampler, context: &Self::Context) -> TokenId;

    /// Render one token as text into a buffer of `buf_capacity` bytes.
    /// `PieceBufferTooSmall` asks the caller to retry with a larger capacity.
    fn token_to_piece(
        &self,
        model: &Self::Model,
        token: TokenId,
        buf_capacity: usize,
    ) -> Result<String, RuntimeError>;

    fn is_end_token(&self, model: &Self::Model, token: TokenId) -> bool;
}

/// A shared runtime drives a session just as well as an owned one; every
/// binding operation takes `&self`.
impl<T: ModelRuntime> ModelRuntime for std::sync::Arc<T> {
    type Model = T::Model;
    type VisionContext = T::VisionContext;
    type Context = T::Context;
    type Sampler = T::Sampler;

    fn load_language_model(&self, path: &Path) -> Result<Self::Model, RuntimeError> {
        (**self).load_language_model(path)
    }

    fn load_vision_projector(
        &self,
        path: &Path,
        model: &Self::Model,
    ) -> Result<Self::VisionContext, RuntimeError> {
        (**self).load_vision_projector(path, model)
    }

    fn create_context(
        &self,
        model: &Self::Model,
        max_context: usize,
        n_threads: usize,
    ) -> Result<Self::Context, RuntimeError> {
        (**self).create_context(model, max_context, n_threads)
    }

    fn create_sampler(
        &self,
        model: &Self::Model,
        temperature: f32,
        seed: u64,
    ) -> Result<Self::Sampler, RuntimeError> {
        (**self).create_sampler(model, temperature, seed)
    }

    fn tokenize(
        &self,
        vision: &Self::VisionContext,
        request: TokenizeRequest<'_>,
        images: &[Bitmap],
    ) -> Result<Vec<Chunk>, RuntimeError> {
        (**self).tokenize(vision, request, images)
    }

    fn tokenize_text(
        &self,
        model: &Self::Model,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, RuntimeError> {
        (**self).tokenize_text(model, text, add_special, parse_special)
    }

    fn eval_chunks(
        &self,
        vision: &Self::VisionContext,
        context: &mut Self::Context,
        chunks: &[Chunk],
        n_past: u32,
        seq_id: i32,
        batch_capacity: usize,
        logits_last: bool,
    ) -> Result<u32, RuntimeError> {
        (**self).eval_chunks(
            vision,
            context,
            chunks,
            n_past,
            seq_id,
            batch_capacity,
            logits_last,
        )
    }

    fn decode(&self, context: &mut Self::Context, batch: &DecodeBatch) -> Result<(), RuntimeError> {
        (**self).decode(context, batch)
    }

    fn sample(&self, sampler: &mut Self::Sampler, context: &Self::Context) -> TokenId {
        (**self).sample(sampler, context)
    }

    fn token_to_piece(
        &self,
        model: &Self::Model,
        token: TokenId,
        buf_capacity: usize,
    ) -> Result<String, RuntimeError> {
        (**self).token_to_piece(model, token, buf_capacity)
    }

    fn is_end_token(&self, model: &Self::Model, token: TokenId) -> bool {
        (**self).is_end_token(model, token)
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunk, DecodeBatch};

    #[test]
    fn chunk_token_count_covers_text_and_image() {
        assert_eq!(
            Chunk::Text {
                tokens: vec![1, 2, 3]
            }
            .token_count(),
            3
        );
        assert_eq!(Chunk::Image { embed_tokens: 81 }.token_count(), 81);
    }

    #[test]
    fn batch_clears_and_refills() {
        let mut batch = DecodeBatch::new(4);
        batch.push(7, 0, &[0], true);
        assert_eq!(batch.len(), 1);
        batch.clear();
        assert!(batch.is_empty());
        batch.push(8, 1, &[0], true);
        assert_eq!(batch.entries()[0].token, 8);
    }

    #[test]
    #[should_panic(expected = "decode batch overflow")]
    fn batch_overflow_fails_loud() {
        let mut batch = DecodeBatch::new(1);
        batch.push(1, 0, &[0], false);
        batch.push(2, 1, &[0], true);
    }
}
