use std::path::Path;

use geo::{
    point, Area, BoundingRect, Contains, Coord, EuclideanLength, HasDimensions, LineString,
    MinimumRotatedRect, Polygon, Rect, Translate,
};
use geo_clipper::{Clipper, EndType, JoinType};
use image::{DynamicImage, GrayImage, ImageBuffer, Pixel, Rgb};
use imageproc::point::Point;
use ndarray::{s, Array3, ArrayView2, Axis};
use ort::{ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use super::ExecutionProvider;

/// Opens an ONNX model with the shared session settings.
#[instrument(level = "debug", skip(execution_providers))]
pub(crate) fn build_session(
    path: &Path,
    num_threads: usize,
    execution_providers: &[ExecutionProvider],
) -> ort::Result<Session> {
    // DirectML does not support parallel execution or memory patterns.
    #[cfg(feature = "directml")]
    let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
    #[cfg(not(feature = "directml"))]
    let parallel = true;

    let dispatch = execution_providers.iter().filter_map(
        |provider| -> Option<ExecutionProviderDispatch> {
            match provider {
                ExecutionProvider::Default => None,
                #[cfg(feature = "coreml")]
                ExecutionProvider::CoreML => Some(ort::CoreMLExecutionProvider::default().build()),
                #[cfg(feature = "cuda")]
                ExecutionProvider::Cuda => Some(ort::CUDAExecutionProvider::default().build()),
                #[cfg(feature = "directml")]
                ExecutionProvider::DirectML => {
                    Some(ort::DirectMLExecutionProvider::default().build())
                }
            }
        },
    );

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_memory_pattern(parallel)?
        .with_parallel_execution(parallel)?
        .with_inter_threads(num_threads)?
        .with_intra_threads(num_threads)?
        .with_execution_providers(dispatch)?
        .commit_from_file(path)?;

    log::debug!("{} inputs: {:?}", path.display(), session.inputs);
    log::debug!("{} outputs: {:?}", path.display(), session.outputs);

    Ok(session)
}

/// CHW float tensor of `image`, with `(pixel * norm) - (mean * norm)` applied per channel.
#[instrument(level = "debug", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

/// Probability map to an 8-bit mask image.
pub(crate) fn to_luma_image(data: ArrayView2<f32>) -> Option<GrayImage> {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    let pixel_data = data
        .axis_iter(Axis(0))
        .flat_map(|row| row.into_iter())
        .map(|p| (p.clamp(0.0, 1.0) * 255.0) as u8)
        .collect::<Vec<u8>>();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
}

pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f32> {
    let points = points
        .iter()
        .map(|point| Coord {
            x: point.x as f32,
            y: point.y as f32,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

pub(crate) fn max_side(rect: &Polygon<f32>) -> f32 {
    rect.exterior()
        .lines()
        .map(|line| line.euclidean_length())
        .fold(0.0, f32::max)
        .floor()
}

/// Mean probability inside `rect`.
pub(crate) fn box_score_fast(rect: &Polygon<f32>, pred_data: ArrayView2<f32>) -> f32 {
    let Some(bounds) = rect.bounding_rect() else {
        return 0.0;
    };
    let (rows, cols) = pred_data.dim();
    let min = bounds.min();
    let max = bounds.max();
    let (x0, x1) = (min.x.max(0.0) as usize, (max.x.max(0.0) as usize).min(cols));
    let (y0, y1) = (min.y.max(0.0) as usize, (max.y.max(0.0) as usize).min(rows));
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }

    let sliced = pred_data.slice(s![y0..y1, x0..x1]);
    let local_rect = rect.translate(-(x0 as f32), -(y0 as f32));

    let (sum, count) = sliced
        .indexed_iter()
        .filter(|((y, x), _)| local_rect.contains(&point![x: *x as f32, y: *y as f32]))
        .fold((0.0, 0usize), |(sum, count), (_, value)| (sum + value, count + 1));

    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Grows a detected box outwards; DB-style detectors predict shrunken text kernels.
pub(crate) fn unclip(rect: Polygon<f32>, unclip_ratio: f32) -> Option<Polygon<f32>> {
    let perimeter = rect.exterior().euclidean_length();
    if perimeter <= 0.0 {
        return None;
    }
    let distance = rect.unsigned_area() * unclip_ratio / perimeter;

    let grown = rect.offset(distance, JoinType::Round(0.25), EndType::ClosedPolygon, 1.0);

    if grown.is_empty() {
        None
    } else {
        grown.minimum_rotated_rect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scale {
    pub factor_x: f32,
    pub factor_y: f32,
    pub target_width: u32,
    pub target_height: u32,
}

/// Detector input size: the longer side capped at `target_size`, both sides
/// floored to a multiple of 32.
pub fn scale_normalized(width: u32, height: u32, target_size: u32) -> Scale {
    let aspect_ratio = width as f32 / height.max(1) as f32;
    let (target_width, target_height) = if aspect_ratio >= 1.0 {
        let target_width = width.min(target_size);
        (target_width, (target_width as f32 / aspect_ratio) as u32)
    } else {
        let target_height = height.min(target_size);
        ((target_height as f32 * aspect_ratio) as u32, target_height)
    };
    let target_width = (target_width / 32 * 32).max(32);
    let target_height = (target_height / 32 * 32).max(32);
    log::debug!(
        "Detector input {width}x{height} -> {target_width}x{target_height}"
    );
    Scale {
        target_width,
        target_height,
        factor_x: width as f32 / target_width as f32,
        factor_y: height as f32 / target_height as f32,
    }
}

/// Crop of `image` covering `bounds`, clamped to the image.
pub(crate) fn part_image(image: &DynamicImage, bounds: &Rect<f32>) -> DynamicImage {
    let clamp_x = |x: f32| (x.max(0.0) as u32).min(image.width());
    let clamp_y = |y: f32| (y.max(0.0) as u32).min(image.height());
    let (x0, x1) = (clamp_x(bounds.min().x), clamp_x(bounds.max().x));
    let (y0, y1) = (clamp_y(bounds.min().y), clamp_y(bounds.max().y));
    log::trace!("Cropping line image to ({x0}, {y0})-({x1}, {y1})");
    image.crop_imm(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use ndarray::Array2;

    #[test]
    fn scale_floors_to_multiple_of_32() {
        let scale = scale_normalized(1000, 500, 640);
        assert_eq!((scale.target_width, scale.target_height), (640, 320));
        assert!((scale.factor_x - 1000.0 / 640.0).abs() < 1e-6);

        let tiny = scale_normalized(10, 10, 640);
        assert_eq!((tiny.target_width, tiny.target_height), (32, 32));
    }

    #[test]
    fn box_score_is_mean_inside() {
        let mut pred = Array2::<f32>::zeros((10, 10));
        pred.slice_mut(s![2..6, 2..6]).fill(1.0);
        let rect = polygon![
            (x: 2.0, y: 2.0),
            (x: 5.0, y: 2.0),
            (x: 5.0, y: 5.0),
            (x: 2.0, y: 5.0),
        ];
        assert!((box_score_fast(&rect, pred.view()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn box_score_outside_map_is_zero() {
        let pred = Array2::<f32>::ones((4, 4));
        let rect = polygon![
            (x: 10.0, y: 10.0),
            (x: 12.0, y: 10.0),
            (x: 12.0, y: 12.0),
        ];
        assert_eq!(box_score_fast(&rect, pred.view()), 0.0);
    }

    #[test]
    fn crop_is_clamped() {
        let image = DynamicImage::ImageLuma8(GrayImage::new(10, 10));
        let bounds = Rect::new(Coord { x: 6.0, y: -2.0 }, Coord { x: 20.0, y: 4.0 });
        let part = part_image(&image, &bounds);
        assert_eq!((part.width(), part.height()), (4, 4));
    }
}
