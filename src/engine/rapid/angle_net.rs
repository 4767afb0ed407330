use std::path::Path;

use float_ord::FloatOrd;
use image::{imageops::FilterType, DynamicImage};
use ndarray::Axis;
use ort::{inputs, Session};
use tracing::instrument;

use super::{
    util::{build_session, subtract_mean_normalize},
    Angle, ExecutionProvider,
};
use crate::error::RecognitionError;

const DEST_WIDTH: u32 = 192;
const DEST_HEIGHT: u32 = 48;

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];

/// Classifies line crops as upright (index 0) or upside down (index 1).
pub struct AngleNet {
    session: Session,
}

impl AngleNet {
    pub fn init(
        path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> ort::Result<Self> {
        Ok(Self {
            session: build_session(path, num_threads, execution_providers)?,
        })
    }

    /// With `most_angle`, every crop gets the majority orientation.
    #[instrument(level = "debug", skip(self, images))]
    pub fn get_angles(
        &self,
        images: &[DynamicImage],
        most_angle: bool,
    ) -> Result<Vec<Angle>, RecognitionError> {
        let mut angles = images
            .iter()
            .map(|image| self.get_angle(image))
            .collect::<Result<Vec<_>, _>>()?;

        if most_angle && !angles.is_empty() {
            let flipped = angles.iter().filter(|angle| angle.index == 1).count();
            let majority = usize::from(flipped * 2 >= angles.len());
            for angle in angles.iter_mut() {
                angle.index = majority;
            }
        }

        Ok(angles)
    }

    #[instrument(level = "trace", skip(self, image))]
    fn get_angle(&self, image: &DynamicImage) -> Result<Angle, RecognitionError> {
        let image = image.resize_exact(DEST_WIDTH, DEST_HEIGHT, FilterType::Nearest);
        let input = subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => input]?)?;
        let output = outputs
            .first_key_value()
            .ok_or_else(|| RecognitionError::Engine("angle model produced no output".into()))?
            .1
            .try_extract_tensor::<f32>()?;

        output
            .iter()
            .enumerate()
            .max_by_key(|(_, score)| FloatOrd(**score))
            .map(|(index, score)| Angle {
                index,
                score: *score,
            })
            .ok_or_else(|| RecognitionError::Engine("angle model produced an empty tensor".into()))
    }
}
