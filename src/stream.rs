//! Streaming bridge and single-worker serialization.
//!
//! A [`SessionHandle`] is the opaque token for one session: `open` spawns
//! the worker that exclusively owns the [`SessionManager`], `close` (or
//! drop) tears it down, exactly once. Every operation — loading, image
//! submission, generation — travels through one command queue, so no two
//! calls can ever interleave on the shared batch buffer or position
//! counter.
//!
//! Per-call closures live in a registry owned by the worker for the full
//! duration of the call and are released exactly once, on completion;
//! fragment callbacks fire in generation order, and a failing call still
//! gets its completion (preceded by an error fragment) instead of leaving
//! the consumer hanging.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::bitmap::Bitmap;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::runtime::ModelRuntime;
use crate::session::SessionManager;

type FragmentFn = Box<dyn FnMut(&str) + Send>;
type CompletionFn = Box<dyn FnOnce(Result<()>) + Send>;

enum Command {
    LoadModels {
        language: PathBuf,
        vision: PathBuf,
        reply: Sender<Result<()>>,
    },
    SubmitBitmap {
        bitmap: Bitmap,
        reply: Sender<Result<()>>,
    },
    SubmitImageFile {
        path: PathBuf,
        reply: Sender<Result<()>>,
    },
    PendingImages {
        reply: Sender<usize>,
    },
    Generate {
        prompt: String,
        max_tokens: usize,
        on_fragment: FragmentFn,
        on_complete: CompletionFn,
    },
    Close,
}

enum Event {
    Fragment(String),
    Done(Result<()>),
}

/// Handle to a session running on its own worker thread.
pub struct SessionHandle {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Spawn the worker that owns the session for its whole lifetime.
    pub fn open<R>(runtime: R, config: SessionConfig) -> Result<Self>
    where
        R: ModelRuntime + Send + 'static,
        R::Model: Send,
        R::VisionContext: Send,
        R::Context: Send,
        R::Sampler: Send,
    {
        let (commands, inbox) = mpsc::channel();
        let session = SessionManager::new(runtime, config);
        let worker = thread::Builder::new()
            .name("vlm-session-worker".to_string())
            .spawn(move || worker_loop(session, inbox))
            .map_err(SessionError::WorkerSpawn)?;
        Ok(Self {
            commands,
            worker: Some(worker),
        })
    }

    /// Run the full initialization ladder on the worker.
    pub fn load_models(&self, language_path: &Path, vision_path: &Path) -> Result<()> {
        self.rendezvous(|reply| Command::LoadModels {
            language: language_path.to_path_buf(),
            vision: vision_path.to_path_buf(),
            reply,
        })?
    }

    /// Queue an already-staged bitmap for the next generation call.
    pub fn submit_image(&self, bitmap: Bitmap) -> Result<()> {
        self.rendezvous(|reply| Command::SubmitBitmap { bitmap, reply })?
    }

    /// Decode an image file on the worker and queue it.
    pub fn submit_image_file(&self, path: &Path) -> Result<()> {
        self.rendezvous(|reply| Command::SubmitImageFile {
            path: path.to_path_buf(),
            reply,
        })?
    }

    pub fn pending_images(&self) -> Result<usize> {
        self.rendezvous(|reply| Command::PendingImages { reply })
    }

    /// Dispatch a streaming generation. Fragments arrive on the worker
    /// thread in generation order; the completion callback fires exactly
    /// once after the last fragment, success or failure.
    pub fn generate_streaming(
        &self,
        prompt: &str,
        max_tokens: usize,
        on_fragment: impl FnMut(&str) + Send + 'static,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.commands
            .send(Command::Generate {
                prompt: prompt.to_string(),
                max_tokens,
                on_fragment: Box::new(on_fragment),
                on_complete: Box::new(on_complete),
            })
            .map_err(|_| SessionError::WorkerGone)
    }

    /// Blocking convenience: generate and return the concatenated text.
    pub fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let (events, collected) = mpsc::channel();
        let fragment_events = events.clone();
        self.generate_streaming(
            prompt,
            max_tokens,
            move |piece| {
                let _ = fragment_events.send(Event::Fragment(piece.to_string()));
            },
            move |result| {
                let _ = events.send(Event::Done(result));
            },
        )?;

        let mut text = String::new();
        loop {
            match collected.recv().map_err(|_| SessionError::WorkerGone)? {
                Event::Fragment(piece) => text.push_str(&piece),
                Event::Done(Ok(())) => return Ok(text),
                Event::Done(Err(e)) => return Err(e),
            }
        }
    }

    /// Tear the session down and join the worker.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn rendezvous<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::WorkerGone)?;
        response.recv().map_err(|_| SessionError::WorkerGone)
    }

    fn shutdown(&mut self) {
        if self.worker.is_some() {
            let _ = self.commands.send(Command::Close);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("session worker panicked during shutdown");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CallSinks {
    on_fragment: FragmentFn,
    on_complete: CompletionFn,
}

fn worker_loop<R: ModelRuntime>(mut session: SessionManager<R>, inbox: Receiver<Command>) {
    // The registry owns per-call callback state for the full duration of a
    // generation; removing the entry is the exactly-once completion.
    let mut registry: HashMap<u64, CallSinks> = HashMap::new();
    let mut next_call: u64 = 0;

    while let Ok(command) = inbox.recv() {
        match command {
            Command::LoadModels {
                language,
                vision,
                reply,
            } => {
                let _ = reply.send(session.load_models(&language, &vision));
            }
            Command::SubmitBitmap { bitmap, reply } => {
                session.submit_bitmap(bitmap);
                let _ = reply.send(Ok(()));
            }
            Command::SubmitImageFile { path, reply } => {
                let _ = reply.send(session.submit_image_file(&path));
            }
            Command::PendingImages { reply } => {
                let _ = reply.send(session.pending_image_count());
            }
            Command::Generate {
                prompt,
                max_tokens,
                on_fragment,
                on_complete,
            } => {
                let call_id = next_call;
                next_call += 1;
                registry.insert(
                    call_id,
                    CallSinks {
                        on_fragment,
                        on_complete,
                    },
                );
                debug!(call_id, max_tokens, "generation started");

                let result = match registry.get_mut(&call_id) {
                    Some(sinks) => {
                        session.generate(&prompt, max_tokens, &mut |piece| {
                            (sinks.on_fragment)(piece)
                        })
                    }
                    None => Ok(()),
                };

                if let Some(mut sinks) = registry.remove(&call_id) {
                    if let Err(e) = &result {
                        warn!(call_id, error = %e, "generation failed");
                        (sinks.on_fragment)(&format!("Error: {e}"));
                    }
                    debug!(call_id, ok = result.is_ok(), "generation finished");
                    (sinks.on_complete)(result);
                }
            }
            Command::Close => break,
        }
    }

    session.cleanup();
    debug!("session worker stopped");
}
