//! Turn evaluation and the sample/emit/decode loop.

use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::runtime::{Chunk, ModelRuntime, RuntimeError, TokenId, TokenizeRequest, SEQ_PRIMARY};
use crate::session::{InitStage, SessionManager};
use crate::template::{ChatMessage, IMAGE_MARKER};

impl<R: ModelRuntime> SessionManager<R> {
    /// Render one user message through the chat template, tokenize it
    /// together with every queued image, and feed the chunks through the
    /// incremental evaluator.
    ///
    /// The image queue is drained before tokenization, success or failure:
    /// images are single-use per turn and never replayed. `n_past` advances
    /// only when the whole evaluation succeeds.
    pub fn eval_message(&mut self, content: &str, first_turn: bool) -> Result<()> {
        if self.stage != InitStage::Ready {
            return Err(SessionError::NotReady(
                "eval_message requires a fully initialized session",
            ));
        }
        let rendered = self
            .templates
            .as_ref()
            .ok_or(SessionError::NotReady("chat template missing"))?
            .render(&[ChatMessage::user(content)], true)?;
        debug!(
            prompt_len = rendered.len(),
            images = self.pending_images.len(),
            first_turn,
            "evaluating turn"
        );

        let images = self.pending_images.drain();
        let batch_capacity = self
            .batch
            .as_ref()
            .map(|b| b.capacity())
            .ok_or(SessionError::NotReady("decode batch missing"))?;
        let max_context = self.max_context;
        let n_past = self.n_past;

        let SessionManager {
            runtime,
            vision,
            context,
            ..
        } = self;
        let vision = vision
            .as_ref()
            .ok_or(SessionError::NotReady("vision context missing"))?;
        let context = context
            .as_mut()
            .ok_or(SessionError::NotReady("decoding context missing"))?;

        let request = TokenizeRequest {
            text: &rendered,
            add_special: first_turn,
            parse_special: true,
        };
        let chunks = match runtime.tokenize(vision, request, &images) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, dropped_images = images.len(), "tokenize failed, staged images dropped");
                return Err(SessionError::Tokenize(e));
            }
        };

        let submitted: usize = chunks.iter().map(Chunk::token_count).sum();
        if n_past as usize + submitted > max_context {
            return Err(SessionError::ContextOverflow {
                needed: submitted,
                used: n_past as usize,
                capacity: max_context,
            });
        }

        let new_past = runtime
            .eval_chunks(
                vision,
                context,
                &chunks,
                n_past,
                SEQ_PRIMARY,
                batch_capacity,
                true,
            )
            .map_err(SessionError::Eval)?;
        self.n_past = new_past;
        Ok(())
    }

    /// Evaluate the prompt as a new turn, then sample up to `max_tokens`
    /// tokens, pushing each non-empty text fragment into `sink` before the
    /// token is decoded back into the context.
    ///
    /// Generation ends cleanly on the runtime's end-of-generation token, an
    /// antiprompt suffix match, or `max_tokens`; `max_tokens == 0` is an
    /// immediately-complete empty generation. Completion signalling belongs
    /// to the streaming bridge, not this loop.
    pub fn generate(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        sink: &mut dyn FnMut(&str),
    ) -> Result<()> {
        if self.stage != InitStage::Ready {
            return Err(SessionError::NotReady(
                "generate requires a fully initialized session",
            ));
        }

        let mut prompt = prompt.to_string();
        if !self.pending_images.is_empty() && !prompt.contains(IMAGE_MARKER) {
            prompt = format!("{IMAGE_MARKER} {prompt}");
        }

        let first = self.first_turn;
        self.eval_message(&prompt, first)?;
        self.first_turn = false;

        let max_context = self.max_context;
        let mut generated: Vec<TokenId> = Vec::new();

        let SessionManager {
            runtime,
            model,
            sampler,
            context,
            batch,
            antiprompts,
            n_past,
            ..
        } = self;
        let model = model
            .as_ref()
            .ok_or(SessionError::NotReady("language model missing"))?;
        let sampler = sampler
            .as_mut()
            .ok_or(SessionError::NotReady("sampler missing"))?;
        let context = context
            .as_mut()
            .ok_or(SessionError::NotReady("decoding context missing"))?;
        let batch = batch
            .as_mut()
            .ok_or(SessionError::NotReady("decode batch missing"))?;

        for i in 0..max_tokens {
            let token = runtime.sample(sampler, context);
            generated.push(token);

            if runtime.is_end_token(model, token) {
                debug!(steps = i + 1, "end-of-generation token");
                break;
            }
            if ends_with_antiprompt(&generated, antiprompts) {
                debug!(steps = i + 1, "antiprompt match");
                break;
            }

            let piece = piece_with_retry(&*runtime, model, token)?;
            if !piece.is_empty() {
                // emission precedes the next decode: a slow consumer can
                // delay its own receipt, never token production
                sink(&piece);
            }

            if i + 1 == max_tokens {
                break;
            }

            if *n_past as usize + 1 > max_context {
                return Err(SessionError::ContextOverflow {
                    needed: 1,
                    used: *n_past as usize,
                    capacity: max_context,
                });
            }
            batch.clear();
            batch.push(token, *n_past, &[SEQ_PRIMARY], true);
            runtime
                .decode(context, batch)
                .map_err(SessionError::Decode)?;
            *n_past += 1;
        }

        Ok(())
    }
}

fn ends_with_antiprompt(generated: &[TokenId], antiprompts: &[Vec<TokenId>]) -> bool {
    antiprompts.iter().any(|antiprompt| {
        !antiprompt.is_empty()
            && generated.len() >= antiprompt.len()
            && generated[generated.len() - antiprompt.len()..] == antiprompt[..]
    })
}

fn piece_with_retry<R: ModelRuntime>(
    runtime: &R,
    model: &R::Model,
    token: TokenId,
) -> Result<String> {
    let mut capacity = 64;
    loop {
        match runtime.token_to_piece(model, token, capacity) {
            Ok(piece) => return Ok(piece),
            Err(RuntimeError::PieceBufferTooSmall { needed }) => {
                warn!(token, capacity, needed, "piece buffer too small, retrying");
                capacity = needed.max(capacity * 2);
            }
            Err(e) => return Err(SessionError::Decode(e)),
        }
    }
}
