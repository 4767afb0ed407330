use std::path::Path;

use geo::{Coord, MinimumRotatedRect, Scale};
use image::{imageops::FilterType, DynamicImage, GrayImage};
use imageproc::{
    contours::find_contours,
    contrast::{threshold_mut, ThresholdType},
    distance_transform::Norm,
    morphology::dilate_mut,
};
use ndarray::{ArrayView2, Axis, Ix2};
use ort::{inputs, Session};
use tracing::instrument;

use super::{
    util::{
        self, box_score_fast, build_session, max_side, subtract_mean_normalize, to_geo_poly,
        to_luma_image, unclip,
    },
    ExecutionProvider, TextBox,
};
use crate::error::RecognitionError;

const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

const MIN_SIDE: f32 = 3.0;
const MAX_CANDIDATES: usize = 1000;

/// Differentiable-binarization text detector.
pub struct DbNet {
    session: Session,
}

impl DbNet {
    pub fn init(
        path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> ort::Result<Self> {
        Ok(Self {
            session: build_session(path, num_threads, execution_providers)?,
        })
    }

    /// Text regions of `image` in source-image pixel space.
    ///
    /// `mask_threshold` binarizes the probability map; `score_threshold`
    /// drops regions whose mean probability is lower.
    #[instrument(skip(self, image), level = "debug")]
    pub fn get_text_boxes(
        &self,
        image: &DynamicImage,
        scale: util::Scale,
        mask_threshold: f32,
        score_threshold: f32,
        unclip_ratio: f32,
    ) -> Result<Vec<TextBox>, RecognitionError> {
        let image =
            image.resize_exact(scale.target_width, scale.target_height, FilterType::Nearest);
        let input = subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => input]?)?;
        let pred = outputs
            .first_key_value()
            .ok_or_else(|| RecognitionError::Engine("detection model produced no output".into()))?
            .1
            .try_extract_tensor::<f32>()?;

        let pred = pred
            .to_owned()
            .remove_axis(Axis(0))
            .remove_axis(Axis(0))
            .into_dimensionality::<Ix2>()
            .map_err(|err| RecognitionError::Engine(format!("Unexpected output shape: {err}")))?;

        let mut mask = to_luma_image(pred.view())
            .ok_or_else(|| RecognitionError::Engine("Probability map has no pixels".into()))?;
        threshold_mut(&mut mask, (mask_threshold * 255.0) as u8, ThresholdType::Binary);
        dilate_mut(&mut mask, Norm::L1, 2);

        Ok(find_boxes(pred.view(), &mask, scale, score_threshold, unclip_ratio))
    }
}

#[instrument(skip(pred, mask), level = "trace")]
fn find_boxes(
    pred: ArrayView2<f32>,
    mask: &GrayImage,
    util::Scale {
        factor_x, factor_y, ..
    }: util::Scale,
    score_threshold: f32,
    unclip_ratio: f32,
) -> Vec<TextBox> {
    find_contours::<i32>(mask)
        .into_iter()
        .take(MAX_CANDIDATES)
        .filter(|contour| contour.points.len() > 2)
        .filter_map(|contour| to_geo_poly(&contour.points).minimum_rotated_rect())
        .filter(|rect| max_side(rect) >= MIN_SIDE)
        .map(|rect| {
            let score = box_score_fast(&rect, pred);
            (rect, score)
        })
        .filter(|(_, score)| *score >= score_threshold)
        .filter_map(|(rect, score)| Some((unclip(rect, unclip_ratio)?, score)))
        .filter(|(rect, _)| max_side(rect) >= MIN_SIDE + 2.0)
        .map(|(rect, score)| TextBox {
            score,
            rect: rect.scale_around_point(factor_x, factor_y, Coord::zero()),
        })
        .collect()
}
