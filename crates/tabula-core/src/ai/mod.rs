pub mod generator;
#[cfg(feature = "llm")]
pub mod llama;
pub mod summarizer;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::error::Result;

/// Backend that turns a prompt into text. The default backend is the
/// deterministic heuristic model; a llama.cpp backend is available behind
/// the `llm` feature.
pub trait TextModel: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &str {
        "model"
    }
}

/// Run a model call on a detached thread with a hard timeout. `None` means
/// the deadline passed; the straggler thread finishes into a dead channel.
pub fn call_with_timeout(
    model: Arc<dyn TextModel>,
    prompt: String,
    timeout: Duration,
) -> Option<Result<String>> {
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(model.generate(&prompt));
    });
    rx.recv_timeout(timeout).ok()
}
