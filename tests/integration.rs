use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use scanline::{
    loader::RenderedPage, state::PENDING_TEXT, LineGroup, PdfRasterizer, Pipeline,
    PipelineConfig, PipelineError, RecognitionEngine, RecognitionError, RenderError, Update,
    WordBox,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Renders `pages-N.pdf` as N blank pages. Page `i` is `100 * N + i` pixels
/// wide so the engine can tell documents and pages apart.
struct FakeRasterizer {
    page_delay: Duration,
}

impl FakeRasterizer {
    fn new() -> Self {
        Self {
            page_delay: Duration::ZERO,
        }
    }

    fn slow(page_delay: Duration) -> Self {
        Self { page_delay }
    }
}

fn page_count(path: &Path) -> usize {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("pages-"))
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

impl PdfRasterizer for FakeRasterizer {
    fn rasterize(
        &self,
        path: &Path,
        _dpi: u32,
        _max_pixels: u64,
        sink: &mut dyn FnMut(RenderedPage) -> ControlFlow<()>,
    ) -> Result<(), RenderError> {
        let count = page_count(path);
        for i in 0..count {
            thread::sleep(self.page_delay);
            let width = (100 * count + i) as u32;
            let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(width, 8, Luma([255])));
            let page = RenderedPage {
                number: i + 1,
                count,
                image: Ok(image),
            };
            if sink(page).is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// Reads the page back from its width: `w{width}` and a faint word on line 1,
/// `next` on line 2. Widths in `failing` raise an engine error.
struct FakeEngine {
    failing: Vec<u32>,
    delay: Duration,
}

impl FakeEngine {
    fn new() -> Self {
        Self {
            failing: Vec::new(),
            delay: Duration::ZERO,
        }
    }
}

impl RecognitionEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        _languages: &str,
    ) -> Result<Vec<WordBox>, RecognitionError> {
        thread::sleep(self.delay);
        let (width, _) = image.dimensions();
        if self.failing.contains(&width) {
            return Err(RecognitionError::Engine("smudged page".into()));
        }
        let line = |line| LineGroup {
            block: 1,
            paragraph: 1,
            line,
        };
        Ok(vec![
            WordBox::new(format!("w{width}"), 90.0, line(1)),
            WordBox::new("faint", 45.0, line(1)),
            WordBox::new("next", 80.0, line(2)),
        ])
    }
}

fn pipeline(dir: &Path, engine: FakeEngine, rasterizer: FakeRasterizer) -> Pipeline {
    pipeline_with_timeout(dir, engine, rasterizer, Duration::from_secs(3))
}

fn pipeline_with_timeout(
    dir: &Path,
    engine: FakeEngine,
    rasterizer: FakeRasterizer,
    stop_timeout: Duration,
) -> Pipeline {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = PipelineConfig::builder()
        .temp_dir(dir)
        .stop_timeout(stop_timeout)
        .build();
    Pipeline::new(config, Arc::new(engine), Arc::new(rasterizer))
}

fn completions(updates: &[Update]) -> usize {
    updates
        .iter()
        .filter(|update| matches!(update, Update::RecognitionComplete))
        .count()
}

fn page_paths(pipeline: &Pipeline) -> Vec<PathBuf> {
    pipeline
        .document()
        .unwrap()
        .pages()
        .iter()
        .map(|page| page.path.clone())
        .collect()
}

#[test]
fn failing_page_does_not_stop_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine {
        failing: vec![301],
        ..FakeEngine::new()
    };
    let mut pipeline = pipeline(dir.path(), engine, FakeRasterizer::new());

    pipeline.load("pages-3.pdf");
    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();

    assert!(updates.contains(&Update::DocumentLoaded { pages: 3 }));
    assert_eq!(completions(&updates), 1);
    assert!(updates.iter().any(|update| matches!(
        update,
        Update::PageFailed { index: 1, message } if message.contains("smudged page")
    )));
    let last_percent = updates
        .iter()
        .filter_map(|update| match update {
            Update::Progress(progress) => Some(progress.percent),
            _ => None,
        })
        .max();
    assert_eq!(last_percent, Some(100));

    assert_eq!(pipeline.text_of(0).unwrap(), "w300 faint\nnext");
    assert_eq!(pipeline.text_of(1).unwrap(), "[Recognition failed: smudged page]");
    assert_eq!(pipeline.text_of(2).unwrap(), "w302 faint\nnext");
    assert!(pipeline.document().unwrap().is_complete());
}

#[test]
fn threshold_changes_spare_edited_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());
    pipeline.load("pages-2.pdf");
    pipeline.wait_idle(IDLE_TIMEOUT).unwrap();

    pipeline.set_threshold(50);
    assert_eq!(pipeline.text_of(0).unwrap(), "w200\nnext");

    pipeline.edit_text(1, "typed by hand").unwrap();
    pipeline.set_threshold(85);
    assert_eq!(pipeline.text_of(0).unwrap(), "w200");
    assert_eq!(pipeline.text_of(1).unwrap(), "typed by hand");

    pipeline.reset_edit(1).unwrap();
    assert_eq!(pipeline.text_of(1).unwrap(), "w201");
}

#[test]
fn rerun_clears_edits_and_recognizes_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());
    pipeline.load("pages-2.pdf");
    pipeline.wait_idle(IDLE_TIMEOUT).unwrap();

    pipeline.edit_text(0, "custom").unwrap();
    pipeline.rerun().unwrap();
    assert_eq!(pipeline.text_of(0).unwrap(), PENDING_TEXT);

    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();
    assert_eq!(completions(&updates), 1);
    assert_eq!(pipeline.text_of(0).unwrap(), "w200 faint\nnext");
    assert!(!pipeline.document().unwrap().record(0).unwrap().is_edited());
}

#[test]
fn export_joins_every_page() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());
    pipeline.load("pages-2.pdf");
    pipeline.wait_idle(IDLE_TIMEOUT).unwrap();
    pipeline.edit_text(1, "B").unwrap();

    let expected = "=== Page 1 ===\nw200 faint\nnext\n\n=== Page 2 ===\nB\n";
    assert_eq!(pipeline.export_all().unwrap(), expected);

    let out = dir.path().join("out.txt");
    pipeline.export_to(&out).unwrap();
    assert_eq!(std::fs::read_to_string(out).unwrap(), expected);
}

#[test]
fn reload_discards_results_of_the_previous_document() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine {
        delay: Duration::from_millis(40),
        ..FakeEngine::new()
    };
    let mut pipeline = pipeline(dir.path(), engine, FakeRasterizer::new());

    pipeline.load("pages-6.pdf");
    while !matches!(
        pipeline.next_update(IDLE_TIMEOUT),
        Some(Update::DocumentLoaded { .. }) | None
    ) {}
    let stale_pages = page_paths(&pipeline);

    pipeline.load("pages-2.pdf");
    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();

    assert_eq!(completions(&updates), 1);
    assert!(updates.iter().all(|update| match update {
        Update::PageUpdated(index) | Update::PageFailed { index, .. } => *index < 2,
        _ => true,
    }));
    assert_eq!(pipeline.document().unwrap().page_count(), 2);
    assert!(!pipeline.export_all().unwrap().contains("w60"));
    assert!(stale_pages.iter().all(|path| !path.exists()));
}

#[test]
fn cancelled_load_leaves_no_pages_behind() {
    let dir = tempfile::tempdir().unwrap();
    let rasterizer = FakeRasterizer::slow(Duration::from_millis(20));
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), rasterizer);

    pipeline.load("pages-50.pdf");
    thread::sleep(Duration::from_millis(100));
    assert!(matches!(pipeline.rerun(), Err(PipelineError::Busy)));

    pipeline.cancel_load();
    assert!(!pipeline.is_busy());
    assert!(pipeline.document().is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert!(pipeline.poll().is_empty());
}

#[test]
fn cancel_after_conversion_removes_queued_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());

    pipeline.load("pages-2.pdf");
    thread::sleep(Duration::from_millis(300));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

    pipeline.cancel_load();
    assert!(!pipeline.is_busy());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert!(pipeline.document().is_none());
}

#[test]
fn late_results_from_an_abandoned_run_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine {
        delay: Duration::from_millis(300),
        ..FakeEngine::new()
    };
    let mut pipeline =
        pipeline_with_timeout(dir.path(), engine, FakeRasterizer::new(), Duration::from_millis(20));

    pipeline.load("pages-2.pdf");
    while !matches!(
        pipeline.next_update(IDLE_TIMEOUT),
        Some(Update::DocumentLoaded { .. }) | None
    ) {}
    thread::sleep(Duration::from_millis(50));

    // The first run's workers are still inside the engine and outlive the stop timeout.
    pipeline.rerun().unwrap();
    pipeline.edit_text(0, "custom").unwrap();

    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();
    assert_eq!(completions(&updates), 1);
    assert_eq!(pipeline.text_of(0).unwrap(), "custom");
    assert_eq!(pipeline.text_of(1).unwrap(), "w201 faint\nnext");
}

#[test]
fn single_image_is_used_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("scan.png");
    GrayImage::from_pixel(42, 8, Luma([255])).save(&image_path).unwrap();

    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());
    pipeline.load(&image_path);
    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();

    assert!(updates.contains(&Update::DocumentLoaded { pages: 1 }));
    assert_eq!(pipeline.text_of(0).unwrap(), "w42 faint\nnext");

    drop(pipeline);
    assert!(image_path.exists());
}

#[test]
fn rendered_pages_are_removed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());
    pipeline.load("pages-3.pdf");
    pipeline.wait_idle(IDLE_TIMEOUT).unwrap();

    let paths = page_paths(&pipeline);
    assert_eq!(paths.len(), 3);
    assert!(paths.iter().all(|path| path.exists()));

    pipeline.shutdown();
    assert!(paths.iter().all(|path| !path.exists()));
}

#[test]
fn unsupported_and_empty_documents_fail_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(dir.path(), FakeEngine::new(), FakeRasterizer::new());

    pipeline.load("notes.txt");
    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();
    assert!(updates
        .iter()
        .any(|update| matches!(update, Update::LoadFailed(message) if message.starts_with("Unsupported"))));

    pipeline.load("pages-0.pdf");
    let updates = pipeline.wait_idle(IDLE_TIMEOUT).unwrap();
    assert!(updates.contains(&Update::LoadFailed("No pages found in PDF".into())));
    assert!(matches!(pipeline.rerun(), Err(PipelineError::NoDocument)));
    assert!(matches!(pipeline.export_all(), Err(PipelineError::NoDocument)));
}
