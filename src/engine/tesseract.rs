//! Tesseract via `leptess`. Built with the `tesseract` feature.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat};
use leptess::{LepTess, Variable};
use tracing::instrument;

use super::RecognitionEngine;
use crate::{
    error::RecognitionError,
    word::{parse_tsv, WordBox},
};

/// Runs Tesseract's full-page layout analysis. Block, paragraph and line
/// numbers come straight from Tesseract's TSV output.
#[derive(Debug, Clone, Default)]
pub struct TesseractEngine {
    data_path: Option<String>,
    page_segmentation_mode: Option<u32>,
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory containing the `*.traineddata` files.
    pub fn data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn page_segmentation_mode(mut self, mode: u32) -> Self {
        self.page_segmentation_mode = Some(mode);
        self
    }
}

impl RecognitionEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip(self, image))]
    fn recognize(
        &self,
        image: &DynamicImage,
        languages: &str,
    ) -> Result<Vec<WordBox>, RecognitionError> {
        // A handle per call: LepTess is neither Send nor reentrant.
        let mut lt = LepTess::new(self.data_path.as_deref(), languages).map_err(|err| {
            RecognitionError::Init(format!("Tesseract with languages '{languages}': {err}"))
        })?;

        if let Some(mode) = self.page_segmentation_mode {
            lt.set_variable(Variable::TesseditPagesegMode, &mode.to_string())
                .map_err(|err| RecognitionError::Init(format!("Failed to set PSM: {err}")))?;
        }

        let mut png = Cursor::new(Vec::new());
        image.to_rgb8().write_to(&mut png, ImageFormat::Png)?;
        lt.set_image_from_mem(png.get_ref())
            .map_err(|err| RecognitionError::Engine(format!("Failed to load image: {err}")))?;

        let tsv = lt
            .get_tsv_text(0)
            .map_err(|err| RecognitionError::Engine(format!("Invalid TSV output: {err}")))?;
        Ok(parse_tsv(&tsv))
    }
}
