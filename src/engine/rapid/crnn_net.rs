use std::path::Path;

use float_ord::FloatOrd;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{ArrayView2, Axis, Ix2};
use ort::{inputs, Session};
use tracing::instrument;

use super::{
    util::{build_session, subtract_mean_normalize},
    ExecutionProvider, RecognizedChar, TextLine,
};
use crate::error::RecognitionError;

const DEST_HEIGHT: u32 = 48;

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];

/// Index 0 of the recognizer's classes is the CTC blank.
const BLANK: usize = 0;

/// CTC line recognizer.
pub struct CrnnNet {
    session: Session,
    keys: Vec<String>,
}

impl CrnnNet {
    pub fn init(
        model_path: &Path,
        keys_path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> Result<Self, RecognitionError> {
        let session = build_session(model_path, num_threads, execution_providers)?;
        let keys = std::fs::read_to_string(keys_path).map_err(|err| {
            RecognitionError::Init(format!("Failed to read {}: {err}", keys_path.display()))
        })?;

        Ok(Self {
            session,
            keys: Self::class_table(&keys),
        })
    }

    /// Blank, then one class per dictionary line, then the space character.
    fn class_table(dictionary: &str) -> Vec<String> {
        ["#".to_string()]
            .into_iter()
            .chain(dictionary.lines().map(|line| line.to_string()))
            .chain([" ".to_string()])
            .collect()
    }

    #[instrument(level = "debug", skip(self, images))]
    pub fn get_text_lines(&self, images: &[DynamicImage]) -> Result<Vec<TextLine>, RecognitionError> {
        images
            .iter()
            .map(|image| self.get_text_line(image))
            .collect()
    }

    #[instrument(level = "trace", skip(self, image))]
    fn get_text_line(&self, image: &DynamicImage) -> Result<TextLine, RecognitionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(TextLine::default());
        }
        let scale = DEST_HEIGHT as f32 / image.height() as f32;
        let dest_width = ((image.width() as f32 * scale) as u32).clamp(1, u16::MAX as u32);
        let image = image.resize_exact(dest_width, DEST_HEIGHT, FilterType::Nearest);

        let input = subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => input]?)?;
        let output = outputs
            .first_key_value()
            .ok_or_else(|| RecognitionError::Engine("recognition model produced no output".into()))?
            .1
            .try_extract_tensor::<f32>()?;

        log::trace!("Recognition output shape: {:?}", output.shape());
        let scores = output
            .remove_axis(Axis(0))
            .into_dimensionality::<Ix2>()
            .map_err(|err| RecognitionError::Engine(format!("Unexpected output shape: {err}")))?;

        Ok(ctc_decode(&self.keys, scores))
    }
}

/// Greedy CTC decode: best class per step, dropping blanks and repeats.
fn ctc_decode(keys: &[String], scores: ArrayView2<f32>) -> TextLine {
    let mut chars = Vec::new();
    let mut previous = BLANK;

    for (step, row) in scores.outer_iter().enumerate() {
        let Some((index, score)) = row
            .indexed_iter()
            .max_by_key(|(_, value)| FloatOrd(**value))
            .map(|(index, value)| (index, *value))
        else {
            continue;
        };

        if index != BLANK && index != previous && index < keys.len() {
            chars.push(RecognizedChar {
                text: keys[index].clone(),
                score,
                step,
            });
        }
        previous = index;
    }

    TextLine {
        chars,
        steps: scores.len_of(Axis(0)),
    }
}
