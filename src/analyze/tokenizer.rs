//! Token counting. The analyzer probes once for the primary tokenizer and
//! keeps the heuristic one as the per-record fallback.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::TokenizeError;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerSettings {
    pub min_word_length: usize,
    /// Tokens per filtered word for the heuristic.
    pub language_factor: f64,
    /// `tokenizer.json` for the primary tokenizer.
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for TokenizerSettings {
    fn default() -> Self {
        Self {
            min_word_length: 2,
            language_factor: 0.75,
            tokenizer_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Primary,
    Heuristic,
}

impl TokenizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for TokenizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Tokenizer: Send + Sync {
    fn kind(&self) -> TokenizerKind;
    fn count_tokens(&self, text: &str) -> Result<usize, TokenizeError>;
}

/// Words of at least `min_word_length` characters.
pub fn filtered_word_count(text: &str, min_word_length: usize) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().count() >= min_word_length)
        .count()
}

/// `floor(filtered words * language factor)`. Never fails.
#[derive(Debug, Clone)]
pub struct HeuristicTokenizer {
    min_word_length: usize,
    language_factor: f64,
}

impl HeuristicTokenizer {
    pub fn new(min_word_length: usize, language_factor: f64) -> Self {
        Self {
            min_word_length,
            language_factor,
        }
    }

    pub fn count(&self, text: &str) -> usize {
        let words = filtered_word_count(text, self.min_word_length);
        (words as f64 * self.language_factor).floor() as usize
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn kind(&self) -> TokenizerKind {
        TokenizerKind::Heuristic
    }

    fn count_tokens(&self, text: &str) -> Result<usize, TokenizeError> {
        Ok(self.count(text))
    }
}

/// HuggingFace tokenizer. Counts tokens that are long enough and are not
/// pure punctuation or whitespace.
#[cfg(feature = "hf-tokenizer")]
pub struct PrimaryTokenizer {
    inner: tokenizers::Tokenizer,
    min_word_length: usize,
}

#[cfg(feature = "hf-tokenizer")]
impl PrimaryTokenizer {
    pub fn from_file(path: &std::path::Path, min_word_length: usize) -> Result<Self, TokenizeError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| TokenizeError(format!("load {}: {}", path.display(), e)))?;
        Ok(Self {
            inner,
            min_word_length,
        })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for PrimaryTokenizer {
    fn kind(&self) -> TokenizerKind {
        TokenizerKind::Primary
    }

    fn count_tokens(&self, text: &str) -> Result<usize, TokenizeError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TokenizeError(e.to_string()))?;
        let count = encoding
            .get_tokens()
            .iter()
            .map(|t| t.trim_start_matches(['Ġ', '▁', '#']))
            .filter(|t| t.chars().count() >= self.min_word_length)
            .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
            .count();
        Ok(count)
    }
}

/// Outcome of a single count: which tokenizer produced it and whether the
/// primary one failed on this input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    pub tokens: usize,
    pub kind: TokenizerKind,
    pub fell_back: bool,
}

/// The tokenizer pair selected at construction time.
#[derive(Clone)]
pub struct TokenCounter {
    primary: Option<Arc<dyn Tokenizer>>,
    heuristic: HeuristicTokenizer,
    min_word_length: usize,
}

impl TokenCounter {
    /// Capability probe: use the primary tokenizer when it can be loaded,
    /// otherwise count heuristically.
    pub fn probe(settings: &TokenizerSettings) -> Self {
        let heuristic =
            HeuristicTokenizer::new(settings.min_word_length, settings.language_factor);
        let primary = load_primary(settings);
        match &primary {
            Some(_) => info!("Tokenizer: primary"),
            None => info!("Tokenizer: heuristic (factor {})", settings.language_factor),
        }
        Self {
            primary,
            heuristic,
            min_word_length: settings.min_word_length,
        }
    }

    pub fn heuristic_only(settings: &TokenizerSettings) -> Self {
        Self {
            primary: None,
            heuristic: HeuristicTokenizer::new(settings.min_word_length, settings.language_factor),
            min_word_length: settings.min_word_length,
        }
    }

    pub fn with_primary(primary: Arc<dyn Tokenizer>, settings: &TokenizerSettings) -> Self {
        Self {
            primary: Some(primary),
            ..Self::heuristic_only(settings)
        }
    }

    pub fn selected(&self) -> TokenizerKind {
        match self.primary {
            Some(_) => TokenizerKind::Primary,
            None => TokenizerKind::Heuristic,
        }
    }

    pub fn min_word_length(&self) -> usize {
        self.min_word_length
    }

    pub fn count(&self, text: &str) -> TokenCount {
        if let Some(primary) = &self.primary {
            match primary.count_tokens(text) {
                Ok(tokens) => {
                    return TokenCount {
                        tokens,
                        kind: primary.kind(),
                        fell_back: false,
                    }
                }
                Err(e) => warn!("Primary tokenizer failed, using heuristic: {}", e),
            }
            return TokenCount {
                tokens: self.heuristic.count(text),
                kind: TokenizerKind::Heuristic,
                fell_back: true,
            };
        }
        TokenCount {
            tokens: self.heuristic.count(text),
            kind: TokenizerKind::Heuristic,
            fell_back: false,
        }
    }
}

#[cfg(feature = "hf-tokenizer")]
fn load_primary(settings: &TokenizerSettings) -> Option<Arc<dyn Tokenizer>> {
    let path = settings.tokenizer_path.as_ref()?;
    match PrimaryTokenizer::from_file(path, settings.min_word_length) {
        Ok(t) => Some(Arc::new(t)),
        Err(e) => {
            warn!("Primary tokenizer unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "hf-tokenizer"))]
fn load_primary(settings: &TokenizerSettings) -> Option<Arc<dyn Tokenizer>> {
    if settings.tokenizer_path.is_some() {
        warn!("tokenizer_path is set but forumdb was built without --features hf-tokenizer");
    }
    None
}
