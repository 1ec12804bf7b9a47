//! Initialization ladder and teardown.
//!
//! Each step requires the session to sit exactly one rung below it. Calling
//! a step while later-stage resources exist wipes the whole session first
//! (re-loading always starts from `Unloaded`, never from a stale handle),
//! and any sub-step failure cleans up before reporting, so callers never
//! observe a half-initialized session that looks ready.

use std::path::Path;

use tracing::{debug, error, info};

use crate::config::clamp_threads;
use crate::error::{Result, SessionError};
use crate::runtime::{DecodeBatch, ModelRuntime};
use crate::session::{InitStage, SessionManager};
use crate::template::ChatTemplates;

impl<R: ModelRuntime> SessionManager<R> {
    pub fn load_language_model(&mut self, path: &Path) -> Result<()> {
        self.cleanup();
        info!(path = %path.display(), "loading language model");
        match self.runtime.load_language_model(path) {
            Ok(model) => {
                self.model = Some(model);
                self.stage = InitStage::LanguageLoaded;
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "language model load failed");
                Err(SessionError::LanguageLoad(e))
            }
        }
    }

    pub fn load_vision_model(&mut self, path: &Path) -> Result<()> {
        self.expect_stage(
            InitStage::LanguageLoaded,
            "load_vision_model follows load_language_model",
        )?;
        let model = self
            .model
            .as_ref()
            .ok_or(SessionError::NotReady("language model missing"))?;
        info!(path = %path.display(), "loading vision projector");
        match self.runtime.load_vision_projector(path, model) {
            Ok(vision) => {
                self.vision = Some(vision);
                self.stage = InitStage::VisionLoaded;
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "vision projector load failed");
                self.cleanup();
                Err(SessionError::VisionLoad(e))
            }
        }
    }

    pub fn initialize_context(&mut self, max_context: usize, threads: usize) -> Result<()> {
        self.expect_stage(
            InitStage::VisionLoaded,
            "initialize_context follows load_vision_model",
        )?;
        let threads = clamp_threads(threads);
        let model = self
            .model
            .as_ref()
            .ok_or(SessionError::NotReady("language model missing"))?;
        match self.runtime.create_context(model, max_context, threads) {
            Ok(context) => {
                info!(max_context, threads, "decoding context created");
                self.context = Some(context);
                self.max_context = max_context;
                self.stage = InitStage::ContextReady;
                Ok(())
            }
            Err(e) => {
                error!(max_context, error = %e, "decoding context init failed");
                self.cleanup();
                Err(SessionError::ContextInit(e))
            }
        }
    }

    pub fn initialize_batch(&mut self, capacity: usize) -> Result<()> {
        self.expect_stage(
            InitStage::ContextReady,
            "initialize_batch follows initialize_context",
        )?;
        self.batch = Some(DecodeBatch::new(capacity));
        self.stage = InitStage::BatchReady;
        Ok(())
    }

    pub fn initialize_sampler(&mut self, temperature: f32, seed: u64) -> Result<()> {
        self.expect_stage(
            InitStage::BatchReady,
            "initialize_sampler follows initialize_batch",
        )?;
        let model = self
            .model
            .as_ref()
            .ok_or(SessionError::NotReady("language model missing"))?;
        match self.runtime.create_sampler(model, temperature, seed) {
            Ok(sampler) => {
                debug!(temperature, seed, "sampler chain created");
                self.sampler = Some(sampler);
                self.stage = InitStage::SamplerReady;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "sampler init failed");
                self.cleanup();
                Err(SessionError::SamplerInit(e))
            }
        }
    }

    /// Compile the chat template and derive antiprompt token sequences from
    /// its declared stop strings. Templates with a structured end token
    /// declare none, and the suffix check becomes a no-op.
    pub fn initialize_chat_template(&mut self, name: &str) -> Result<()> {
        self.expect_stage(
            InitStage::SamplerReady,
            "initialize_chat_template follows initialize_sampler",
        )?;
        let templates = match ChatTemplates::by_name(name) {
            Ok(t) => t,
            Err(e) => {
                self.cleanup();
                return Err(e);
            }
        };

        let mut antiprompts = Vec::new();
        let mut failure = None;
        {
            let model = match self.model.as_ref() {
                Some(m) => m,
                None => {
                    self.cleanup();
                    return Err(SessionError::NotReady("language model missing"));
                }
            };
            for stop in templates.stop_strings() {
                match self.runtime.tokenize_text(model, stop, false, true) {
                    Ok(tokens) if !tokens.is_empty() => antiprompts.push(tokens),
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(SessionError::TemplateInit(format!(
                            "antiprompt '{stop}': {e}"
                        )));
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            self.cleanup();
            return Err(e);
        }

        info!(
            template = name,
            antiprompts = antiprompts.len(),
            "session ready"
        );
        self.templates = Some(templates);
        self.antiprompts = antiprompts;
        self.stage = InitStage::Ready;
        self.first_turn = true;
        Ok(())
    }

    /// Run the full ladder with the session's configuration. Any failing
    /// step has already torn the session down; the error passes through.
    pub fn load_models(&mut self, language_path: &Path, vision_path: &Path) -> Result<()> {
        let cfg = self.config().clone();
        self.load_language_model(language_path)?;
        self.load_vision_model(vision_path)?;
        self.initialize_context(cfg.max_context, cfg.effective_threads())?;
        self.initialize_batch(cfg.batch_capacity)?;
        self.initialize_sampler(cfg.temperature, cfg.seed)?;
        self.initialize_chat_template(&cfg.template)?;
        Ok(())
    }

    /// Release everything in reverse creation order. Idempotent, and safe
    /// on a partially initialized session.
    pub fn cleanup(&mut self) {
        let had_resources = self.stage != InitStage::Unloaded;
        self.templates = None;
        self.antiprompts.clear();
        self.sampler = None;
        self.batch = None;
        self.context = None;
        self.vision = None;
        self.model = None;
        self.pending_images.clear();
        self.n_past = 0;
        self.first_turn = true;
        self.max_context = 0;
        self.stage = InitStage::Unloaded;
        if had_resources {
            debug!("session resources released");
        }
    }

    fn expect_stage(&mut self, expected: InitStage, op: &'static str) -> Result<()> {
        if self.stage == expected {
            return Ok(());
        }
        if self.stage > expected {
            // later-stage resources exist; drop them all rather than risk
            // pairing fresh handles with stale ones
            self.cleanup();
        }
        Err(SessionError::OutOfOrder(op))
    }
}
