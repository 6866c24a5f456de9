use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use parking_lot::Mutex;

use crate::ai::TextModel;
use crate::error::{Result, TabulaError};

const DEFAULT_MAX_TOKENS: usize = 256;

struct LoadedModel {
    backend: LlamaBackend,
    model: LlamaModel,
}

// Safety: LlamaBackend and LlamaModel are thread-safe (the C library uses
// internal locking). Access is serialized through the Mutex regardless.
unsafe impl Send for LoadedModel {}
unsafe impl Sync for LoadedModel {}

/// llama.cpp-backed text model, loaded lazily on first call.
pub struct LlamaTextModel {
    inner: Mutex<Option<LoadedModel>>,
    model_path: PathBuf,
    loaded: AtomicBool,
    max_tokens: usize,
}

impl LlamaTextModel {
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            inner: Mutex::new(None),
            model_path,
            loaded: AtomicBool::new(false),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut guard = self.inner.lock();
        // double-check after acquiring lock
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let backend = LlamaBackend::init().map_err(|e| {
            TabulaError::Config(format!("failed to init llama backend: {e}"))
        })?;

        let model_params = LlamaModelParams::default();
        let model_params = std::pin::pin!(model_params);

        let model = LlamaModel::load_from_file(&backend, &self.model_path, &model_params)
            .map_err(|e| {
                TabulaError::Config(format!(
                    "failed to load model {}: {e}",
                    self.model_path.display()
                ))
            })?;

        *guard = Some(LoadedModel { backend, model });
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn run(&self, prompt: &str) -> Result<String> {
        self.ensure_loaded()?;

        let guard = self.inner.lock();
        let loaded = guard
            .as_ref()
            .ok_or_else(|| TabulaError::Config("model not loaded".to_string()))?;

        let n_ctx = NonZeroU32::new(2048)
            .ok_or_else(|| TabulaError::Config("bad context size".to_string()))?;
        let ctx_params = LlamaContextParams::default().with_n_ctx(Some(n_ctx));

        let mut ctx = loaded
            .model
            .new_context(&loaded.backend, ctx_params)
            .map_err(|e| TabulaError::Config(format!("failed to create context: {e}")))?;

        let tokens = loaded
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| TabulaError::Config(format!("tokenization failed: {e}")))?;

        if tokens.is_empty() {
            return Err(TabulaError::Config(
                "prompt tokenized to empty sequence".to_string(),
            ));
        }

        let mut batch = LlamaBatch::new(512, 1);
        let last_index = (tokens.len() - 1) as i32;
        for (i, token) in (0i32..).zip(tokens.iter()) {
            batch
                .add(*token, i, &[0], i == last_index)
                .map_err(|e| TabulaError::Config(format!("batch add failed: {e}")))?;
        }

        ctx.decode(&mut batch)
            .map_err(|e| TabulaError::Config(format!("initial decode failed: {e}")))?;

        let mut sampler =
            LlamaSampler::chain_simple([LlamaSampler::dist(1234), LlamaSampler::greedy()]);

        let mut output = String::new();
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut n_cur = batch.n_tokens();
        let n_len = tokens.len() as i32 + self.max_tokens as i32;

        while n_cur <= n_len {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);

            if loaded.model.is_eog_token(token) {
                break;
            }

            let piece = loaded
                .model
                .token_to_piece(token, &mut decoder, true, None)
                .map_err(|e| TabulaError::Config(format!("token decode failed: {e}")))?;

            output.push_str(&piece);

            // early stop once a statement terminator lands on a line break
            if output.contains(';') && piece.contains('\n') {
                break;
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| TabulaError::Config(format!("batch add failed: {e}")))?;

            ctx.decode(&mut batch)
                .map_err(|e| TabulaError::Config(format!("decode failed: {e}")))?;

            n_cur += 1;
        }

        Ok(output.trim().to_string())
    }
}

impl TextModel for LlamaTextModel {
    fn generate(&self, prompt: &str) -> Result<String> {
        self.run(prompt)
    }

    fn name(&self) -> &str {
        "llama"
    }
}

impl std::fmt::Debug for LlamaTextModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaTextModel")
            .field("model_path", &self.model_path)
            .field("loaded", &self.loaded.load(Ordering::Relaxed))
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}
