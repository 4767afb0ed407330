//! Recognition engines: turn one page image into [`WordBox`]es.

use image::DynamicImage;

use crate::{error::RecognitionError, word::WordBox};

pub mod rapid;
#[cfg(feature = "tesseract")]
pub mod tesseract;

pub use rapid::{DetectionOptions, ExecutionProvider, RapidEngine, RapidEngineBuilder};
#[cfg(feature = "tesseract")]
pub use tesseract::TesseractEngine;

/// A text recognizer for whole page images.
///
/// Words must be returned in the engine's reading order with their
/// `(block, paragraph, line)` group numbers filled in; line reconstruction
/// trusts that order. Implementations are called from several worker threads
/// at once.
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(
        &self,
        image: &DynamicImage,
        languages: &str,
    ) -> Result<Vec<WordBox>, RecognitionError>;
}

/// The language set to hand to the engine: `requested` unchanged, or
/// `default` when `requested` is blank.
pub fn resolve_languages<'a>(requested: &'a str, default: &'a str) -> &'a str {
    if requested.trim().is_empty() {
        default
    } else {
        requested
    }
}
