//! PP-OCR detection, orientation and recognition models run through ONNX Runtime.

use std::path::PathBuf;

use geo::{BoundingRect, Rect};
use image::DynamicImage;
use tracing::instrument;

use angle_net::AngleNet;
use crnn_net::CrnnNet;
use dbnet::DbNet;
use util::{part_image, scale_normalized};

mod angle_net;
mod crnn_net;
pub mod dbnet;
mod result;
pub mod util;

pub use result::*;

use super::RecognitionEngine;
use crate::{
    error::RecognitionError,
    word::{LineGroup, WordBox},
};

pub struct RapidEngineBuilder {
    threads: usize,
    det_path: Option<PathBuf>,
    cls_path: Option<PathBuf>,
    rec_paths: Option<(PathBuf, PathBuf)>,
    options: DetectionOptions,
    execution_providers: Vec<ExecutionProvider>,
}

impl RapidEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads per model session. Pages already run in parallel, so keep this low.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.det_path = Some(path.into());
        self
    }

    pub fn cls_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.cls_path = Some(path.into());
        self
    }

    pub fn rec_model(
        mut self,
        model_path: impl Into<PathBuf>,
        keys_path: impl Into<PathBuf>,
    ) -> Self {
        self.rec_paths = Some((model_path.into(), keys_path.into()));
        self
    }

    /// Looks for `det.onnx`, `rec.onnx`, `keys.txt` and, if present, `cls.onnx`
    /// in `dir`.
    pub fn model_dir(self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let cls = dir.join("cls.onnx");
        let builder = self
            .det_model(dir.join("det.onnx"))
            .rec_model(dir.join("rec.onnx"), dir.join("keys.txt"));
        if cls.exists() {
            builder.cls_model(cls)
        } else {
            builder
        }
    }

    pub fn options(mut self, options: DetectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<RapidEngine, RecognitionError> {
        let det_path = self
            .det_path
            .take()
            .unwrap_or_else(|| "models/ch_PP-OCRv4_det_infer/ch_PP-OCRv4_det_infer.onnx".into());
        let (rec_path, keys_path) = self.rec_paths.take().unwrap_or_else(|| {
            (
                "models/ch_PP-OCRv4_rec_infer/ch_PP-OCRv4_rec_infer.onnx".into(),
                "models/ppocr_keys_v1.txt".into(),
            )
        });
        let providers = &self.execution_providers;

        Ok(RapidEngine {
            det_model: DbNet::init(&det_path, self.threads, providers)?,
            cls_model: self
                .cls_path
                .as_deref()
                .map(|path| AngleNet::init(path, self.threads, providers))
                .transpose()?,
            rec_model: CrnnNet::init(&rec_path, &keys_path, self.threads, providers)?,
            options: self.options,
        })
    }
}

impl Default for RapidEngineBuilder {
    fn default() -> Self {
        Self {
            threads: 1,
            det_path: None,
            cls_path: None,
            rec_paths: None,
            options: DetectionOptions::default(),
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionOptions {
    /// Longest detector input side; `0` keeps the page size.
    pub max_side_len: u32,
    pub box_score_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
    pub most_angle: bool,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            max_side_len: 2048,
            box_score_threshold: 0.5,
            box_threshold: 0.3,
            unclip_ratio: 1.6,
            most_angle: true,
        }
    }
}

/// ONNX recognition engine. Every word it emits is in block 1, paragraph 1;
/// detected boxes sharing a visual row share a line number.
pub struct RapidEngine {
    det_model: DbNet,
    cls_model: Option<AngleNet>,
    rec_model: CrnnNet,
    options: DetectionOptions,
}

/// A recognized line crop awaiting placement.
struct LineCrop {
    bounds: Rect<f32>,
    text: TextLine,
    flipped: bool,
}

impl RapidEngine {
    pub fn builder() -> RapidEngineBuilder {
        RapidEngineBuilder::new()
    }

    fn detect_lines(&self, image: &DynamicImage) -> Result<Vec<LineCrop>, RecognitionError> {
        let DetectionOptions {
            max_side_len,
            box_score_threshold,
            box_threshold,
            unclip_ratio,
            most_angle,
        } = self.options;
        let target = if max_side_len > 0 {
            max_side_len
        } else {
            u32::MAX
        };
        let scale = scale_normalized(image.width(), image.height(), target);

        let bounds = self
            .det_model
            .get_text_boxes(image, scale, box_threshold, box_score_threshold, unclip_ratio)?
            .iter()
            .filter_map(|text_box| text_box.rect.bounding_rect())
            .collect::<Vec<_>>();
        let mut crops = bounds
            .iter()
            .map(|rect| part_image(image, rect))
            .collect::<Vec<_>>();

        let mut flipped = vec![false; crops.len()];
        if let Some(angle_net) = &self.cls_model {
            let angles = angle_net.get_angles(&crops, most_angle)?;
            for ((crop, angle), flip) in crops.iter_mut().zip(angles).zip(flipped.iter_mut()) {
                if angle.index == 1 {
                    *crop = crop.rotate180();
                    *flip = true;
                }
            }
        }

        let lines = self.rec_model.get_text_lines(&crops)?;
        Ok(bounds
            .into_iter()
            .zip(lines)
            .zip(flipped)
            .map(|((bounds, text), flipped)| LineCrop {
                bounds,
                text,
                flipped,
            })
            .collect())
    }
}

impl RecognitionEngine for RapidEngine {
    fn name(&self) -> &'static str {
        "rapid"
    }

    #[instrument(level = "debug", skip(self, image))]
    fn recognize(
        &self,
        image: &DynamicImage,
        languages: &str,
    ) -> Result<Vec<WordBox>, RecognitionError> {
        log::debug!("Language set {languages:?} ignored, the recognition model fixes the alphabet");
        let lines = self.detect_lines(image)?;
        let rows = assign_rows(&lines.iter().map(|line| line.bounds).collect::<Vec<_>>());

        let mut placed = lines.into_iter().zip(rows).collect::<Vec<_>>();
        placed.sort_by(|(a, row_a), (b, row_b)| {
            row_a
                .cmp(row_b)
                .then(a.bounds.min().x.total_cmp(&b.bounds.min().x))
        });

        Ok(placed
            .iter()
            .flat_map(|(line, row)| line_words(line, *row as i32 + 1))
            .collect())
    }
}

/// Row number for each box: boxes are taken top to bottom and join the
/// current row while their vertical centre lies inside it.
fn assign_rows(bounds: &[Rect<f32>]) -> Vec<usize> {
    let mut order = (0..bounds.len()).collect::<Vec<_>>();
    order.sort_by(|a, b| bounds[*a].center().y.total_cmp(&bounds[*b].center().y));

    let mut rows = vec![0; bounds.len()];
    let mut row = 0;
    let mut extent: Option<(f32, f32)> = None;
    for index in order {
        let rect = bounds[index];
        match extent {
            Some((top, bottom)) if rect.center().y <= bottom && rect.center().y >= top => {
                extent = Some((top.min(rect.min().y), bottom.max(rect.max().y)));
            }
            Some(_) => {
                row += 1;
                extent = Some((rect.min().y, rect.max().y));
            }
            None => extent = Some((rect.min().y, rect.max().y)),
        }
        rows[index] = row;
    }
    rows
}

fn line_words(line: &LineCrop, line_num: i32) -> Vec<WordBox> {
    let group = LineGroup {
        block: 1,
        paragraph: 1,
        line: line_num,
    };
    let left = line.bounds.min().x;
    let width = line.bounds.width();

    line.text
        .words()
        .into_iter()
        .map(|span| {
            let (start, end) = if line.flipped {
                (1.0 - span.end, 1.0 - span.start)
            } else {
                (span.start, span.end)
            };
            let x0 = (left + start * width).round() as i32;
            let x1 = (left + end * width).round() as i32;
            WordBox::new(span.text, span.confidence, group).with_bounds(
                x0,
                line.bounds.min().y.round() as i32,
                x1 - x0,
                line.bounds.height().round() as i32,
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;

    fn rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Rect<f32> {
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 })
    }

    #[test]
    fn boxes_on_one_row_share_a_line() {
        let bounds = [
            rect(300.0, 12.0, 400.0, 42.0),
            rect(10.0, 100.0, 200.0, 130.0),
            rect(10.0, 10.0, 250.0, 40.0),
        ];
        assert_eq!(assign_rows(&bounds), vec![0, 1, 0]);
    }

    #[test]
    fn words_are_placed_inside_the_line() {
        let line = LineCrop {
            bounds: rect(100.0, 50.0, 200.0, 70.0),
            text: TextLine {
                chars: ["a", "b", " ", "c"]
                    .iter()
                    .enumerate()
                    .map(|(i, text)| RecognizedChar {
                        text: text.to_string(),
                        score: 0.9,
                        step: i * 2,
                    })
                    .collect(),
                steps: 10,
            },
            flipped: false,
        };

        let words = line_words(&line, 3);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "ab");
        assert_eq!((words[0].left, words[0].width), (100, 30));
        assert_eq!((words[1].left, words[1].width), (160, 10));
        assert_eq!((words[1].top, words[1].height), (50, 20));
        assert!(words.iter().all(|word| word.line_num == 3 && word.block_num == 1));
    }

    #[test]
    fn flipped_lines_mirror_word_positions() {
        let line = LineCrop {
            bounds: rect(0.0, 0.0, 100.0, 10.0),
            text: TextLine {
                chars: vec![RecognizedChar {
                    text: "x".to_string(),
                    score: 0.8,
                    step: 0,
                }],
                steps: 4,
            },
            flipped: true,
        };
        let words = line_words(&line, 1);
        assert_eq!((words[0].left, words[0].width), (75, 25));
    }
}
