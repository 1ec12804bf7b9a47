//! Deterministic in-memory runtime used by the test suite.
//!
//! Tokenization interns whitespace-separated words; the sampler replays a
//! scripted token sequence and falls back to the end token when the script
//! runs dry. Individual operations can be made to fail to exercise the
//! error paths.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use crate::bitmap::Bitmap;
use crate::runtime::{Chunk, DecodeBatch, ModelRuntime, RuntimeError, TokenId, TokenizeRequest};

pub(crate) const END_TOKEN: TokenId = 0;

/// KV-cache positions one stub image occupies.
pub(crate) const IMAGE_EMBED_TOKENS: usize = 4;

#[derive(Debug, Default)]
pub(crate) struct StubModel;

#[derive(Debug, Default)]
pub(crate) struct StubVision;

#[derive(Debug, Default)]
pub(crate) struct StubContext;

#[derive(Debug, Default)]
pub(crate) struct StubSampler;

#[derive(Default)]
pub(crate) struct StubRuntime {
    // token id == index; id 0 is the end token
    vocab: Mutex<Vec<String>>,
    script: Mutex<VecDeque<TokenId>>,
    pub(crate) fail_language_load: bool,
    pub(crate) fail_vision_load: bool,
    pub(crate) fail_context: bool,
    pub(crate) fail_sampler: bool,
    pub(crate) fail_tokenize: bool,
    fail_decode_after: Mutex<Option<usize>>,
    short_piece_buffer_once: Mutex<bool>,
    pub(crate) bos_flags: Mutex<Vec<bool>>,
    prompts: Mutex<Vec<String>>,
    evaluated_tokens: Mutex<usize>,
    decode_calls: Mutex<usize>,
}

impl StubRuntime {
    pub(crate) fn new() -> Self {
        let runtime = Self::default();
        runtime
            .vocab
            .lock()
            .expect("vocab lock")
            .push("<end>".to_string());
        runtime
    }

    fn intern(&self, word: &str) -> TokenId {
        let mut vocab = self.vocab.lock().expect("vocab lock");
        if let Some(idx) = vocab.iter().position(|w| w == word) {
            return idx as TokenId;
        }
        vocab.push(word.to_string());
        (vocab.len() - 1) as TokenId
    }

    /// Intern `text` word by word, returning the ids (scripting helper).
    pub(crate) fn ids_for(&self, text: &str) -> Vec<TokenId> {
        text.split_whitespace().map(|w| self.intern(w)).collect()
    }

    /// Queue token ids for the sampler to emit, in order.
    pub(crate) fn push_script(&self, tokens: &[TokenId]) {
        self.script.lock().expect("script lock").extend(tokens);
    }

    /// Make the `nth` decode call (0-based) fail.
    pub(crate) fn fail_decode_at(&self, nth: usize) {
        *self.fail_decode_after.lock().expect("decode lock") = Some(nth);
    }

    /// Force one `PieceBufferTooSmall` before the next piece succeeds.
    pub(crate) fn short_piece_buffer_once(&self) {
        *self.short_piece_buffer_once.lock().expect("piece lock") = true;
    }

    pub(crate) fn evaluated_tokens(&self) -> usize {
        *self.evaluated_tokens.lock().expect("eval lock")
    }

    pub(crate) fn bos_flags_seen(&self) -> Vec<bool> {
        self.bos_flags.lock().expect("bos lock").clone()
    }

    /// Rendered prompts the multimodal tokenizer has seen, in order.
    pub(crate) fn prompts_seen(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl ModelRuntime for StubRuntime {
    type Model = StubModel;
    type VisionContext = StubVision;
    type Context = StubContext;
    type Sampler = StubSampler;

    fn load_language_model(&self, path: &Path) -> Result<StubModel, RuntimeError> {
        if self.fail_language_load {
            return Err(RuntimeError::FileNotFound(path.display().to_string()));
        }
        Ok(StubModel)
    }

    fn load_vision_projector(
        &self,
        path: &Path,
        _model: &StubModel,
    ) -> Result<StubVision, RuntimeError> {
        if self.fail_vision_load {
            return Err(RuntimeError::IncompatibleFormat(path.display().to_string()));
        }
        Ok(StubVision)
    }

    fn create_context(
        &self,
        _model: &StubModel,
        max_context: usize,
        _n_threads: usize,
    ) -> Result<StubContext, RuntimeError> {
        if self.fail_context {
            return Err(RuntimeError::ResourceExhausted(format!(
                "cannot allocate KV cache for {max_context} positions"
            )));
        }
        Ok(StubContext)
    }

    fn create_sampler(
        &self,
        _model: &StubModel,
        _temperature: f32,
        _seed: u64,
    ) -> Result<StubSampler, RuntimeError> {
        if self.fail_sampler {
            return Err(RuntimeError::Internal("sampler init refused".to_string()));
        }
        Ok(StubSampler)
    }

    fn tokenize(
        &self,
        _vision: &StubVision,
        request: TokenizeRequest<'_>,
        images: &[Bitmap],
    ) -> Result<Vec<Chunk>, RuntimeError> {
        self.bos_flags
            .lock()
            .expect("bos lock")
            .push(request.add_special);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.text.to_string());
        if self.fail_tokenize {
            return Err(RuntimeError::Tokenize(-1));
        }

        let mut chunks = Vec::new();
        let tokens = self.ids_for(request.text);
        if !tokens.is_empty() {
            chunks.push(Chunk::Text { tokens });
        }
        for _ in images {
            chunks.push(Chunk::Image {
                embed_tokens: IMAGE_EMBED_TOKENS,
            });
        }
        Ok(chunks)
    }

    fn tokenize_text(
        &self,
        _model: &StubModel,
        text: &str,
        _add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, RuntimeError> {
        Ok(self.ids_for(text))
    }

    fn eval_chunks(
        &self,
        _vision: &StubVision,
        _context: &mut StubContext,
        chunks: &[Chunk],
        n_past: u32,
        _seq_id: i32,
        _batch_capacity: usize,
        _logits_last: bool,
    ) -> Result<u32, RuntimeError> {
        let submitted: usize = chunks.iter().map(Chunk::token_count).sum();
        *self.evaluated_tokens.lock().expect("eval lock") += submitted;
        Ok(n_past + submitted as u32)
    }

    fn decode(&self, _context: &mut StubContext, batch: &DecodeBatch) -> Result<(), RuntimeError> {
        let call = {
            let mut calls = self.decode_calls.lock().expect("decode calls lock");
            let current = *calls;
            *calls += 1;
            current
        };
        if let Some(nth) = *self.fail_decode_after.lock().expect("decode lock") {
            if call == nth {
                return Err(RuntimeError::Internal("scripted decode failure".to_string()));
            }
        }
        *self.evaluated_tokens.lock().expect("eval lock") += batch.len();
        Ok(())
    }

    fn sample(&self, _sampler: &mut StubSampler, _context: &StubContext) -> TokenId {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(END_TOKEN)
    }

    fn token_to_piece(
        &self,
        _model: &StubModel,
        token: TokenId,
        buf_capacity: usize,
    ) -> Result<String, RuntimeError> {
        let mut short = self.short_piece_buffer_once.lock().expect("piece lock");
        if *short {
            *short = false;
            return Err(RuntimeError::PieceBufferTooSmall {
                needed: buf_capacity * 2,
            });
        }
        let vocab = self.vocab.lock().expect("vocab lock");
        match vocab.get(token as usize) {
            Some(_) if token == END_TOKEN => Ok(String::new()),
            Some(word) => Ok(format!("{word} ")),
            None => Err(RuntimeError::Internal(format!("unknown token {token}"))),
        }
    }

    fn is_end_token(&self, _model: &StubModel, token: TokenId) -> bool {
        token == END_TOKEN
    }
}
