//! The session manager: owns every native resource of one model session
//! and drives multi-turn, incremental decoding against it.

mod generate;
mod lifecycle;

use std::path::Path;

use crate::bitmap::{stage_from_buffer, Bitmap, PendingImageQueue, PixelLayout};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::images;
use crate::runtime::{DecodeBatch, ModelRuntime, TokenId};
use crate::template::ChatTemplates;

/// Initialization ladder. Resources are created strictly in this order and
/// torn down in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitStage {
    Unloaded,
    LanguageLoaded,
    VisionLoaded,
    ContextReady,
    BatchReady,
    SamplerReady,
    Ready,
}

/// One model session: handles, position bookkeeping, and the pending
/// image queue.
///
/// All handle-touching operations take `&mut self`; callers needing
/// cross-thread access go through [`crate::stream::SessionHandle`], which
/// serializes everything onto a single worker.
pub struct SessionManager<R: ModelRuntime> {
    // Field order is drop order: reverse of the creation ladder, so a
    // forgotten cleanup still releases the handles safely.
    pub(crate) templates: Option<ChatTemplates>,
    pub(crate) antiprompts: Vec<Vec<TokenId>>,
    pub(crate) sampler: Option<R::Sampler>,
    pub(crate) batch: Option<DecodeBatch>,
    pub(crate) context: Option<R::Context>,
    pub(crate) vision: Option<R::VisionContext>,
    pub(crate) model: Option<R::Model>,
    pub(crate) pending_images: PendingImageQueue,
    pub(crate) stage: InitStage,
    pub(crate) n_past: u32,
    pub(crate) first_turn: bool,
    pub(crate) max_context: usize,
    config: SessionConfig,
    pub(crate) runtime: R,
}

impl<R: ModelRuntime> SessionManager<R> {
    pub fn new(runtime: R, config: SessionConfig) -> Self {
        Self {
            templates: None,
            antiprompts: Vec::new(),
            sampler: None,
            batch: None,
            context: None,
            vision: None,
            model: None,
            pending_images: PendingImageQueue::new(),
            stage: InitStage::Unloaded,
            n_past: 0,
            first_turn: true,
            max_context: 0,
            config,
            runtime,
        }
    }

    pub fn stage(&self) -> InitStage {
        self.stage
    }

    pub fn is_ready(&self) -> bool {
        self.stage == InitStage::Ready
    }

    /// Tokens currently resident in the KV cache.
    pub fn n_past(&self) -> u32 {
        self.n_past
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn pending_image_count(&self) -> usize {
        self.pending_images.len()
    }

    /// Queue an already-staged bitmap for the next turn.
    pub fn submit_bitmap(&mut self, bitmap: Bitmap) {
        self.pending_images.push(bitmap);
    }

    /// Stage a raw pixel buffer and queue it for the next turn.
    pub fn submit_image_buffer(
        &mut self,
        raw: &[u8],
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Result<()> {
        let bitmap = stage_from_buffer(raw, width, height, layout)?;
        self.pending_images.push(bitmap);
        Ok(())
    }

    /// Decode an image file and queue it for the next turn.
    pub fn submit_image_file(&mut self, path: &Path) -> Result<()> {
        let bitmap = images::load_bitmap(path)?;
        self.pending_images.push(bitmap);
        Ok(())
    }
}
