//! Model tokenizers for chat-memory budgeting.
//!
//! The default counter is [`WordCountTokenizer`] from core. With the
//! `hf-tokenizer` feature, a Hugging Face `tokenizer.json` gives exact
//! counts for the target model.

use std::path::Path;
use std::sync::Arc;

use ragline_core::error::{RagError, Result};
use ragline_core::tokens::{TokenCounter, WordCountTokenizer};

#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    name: String,
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            RagError::validation(format!("load tokenizer {}: {e}", path.display()))
        })?;
        Ok(Self {
            name: format!("hf:{}", path.display()),
            inner,
        })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl TokenCounter for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self, text: &str) -> usize {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                tracing::warn!(error = %e, "tokenizer failed, counting words");
                WordCountTokenizer.count(text)
            }
        }
    }
}

pub fn words() -> Arc<dyn TokenCounter> {
    Arc::new(WordCountTokenizer)
}

/// Load a `tokenizer.json`. Fails when the binary was built without the
/// `hf-tokenizer` feature; silently switching to word counts would change
/// truncation behaviour between builds.
pub fn load_hf(path: &Path) -> Result<Arc<dyn TokenCounter>> {
    #[cfg(feature = "hf-tokenizer")]
    {
        Ok(Arc::new(HfTokenizer::from_file(path)?))
    }
    #[cfg(not(feature = "hf-tokenizer"))]
    {
        Err(RagError::validation(format!(
            "memory.tokenizer = \"hf\" ({}) requires the hf-tokenizer feature",
            path.display()
        )))
    }
}
