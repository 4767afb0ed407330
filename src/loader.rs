use std::{
    fs,
    io::ErrorKind,
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use image::{imageops::FilterType, DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use tracing::instrument;

use crate::{
    config::{PageFailurePolicy, PipelineConfig},
    error::{LoadError, RenderError},
    event::Progress,
};

/// PDF points per inch.
const PDF_POINTS_PER_INCH: f32 = 72.0;

/// Cooperative stop signal shared between a caller and a background job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A page of the loaded document on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub index: usize,
    pub path: PathBuf,
    /// Generated by the loader and deleted with the [`PageSet`]. Original
    /// image files are never temporary.
    pub temporary: bool,
}

/// Ordered pages of one document. Dropping it removes the temporary page files.
#[derive(Debug, Default)]
pub struct PageSet {
    pages: Vec<PageImage>,
}

impl PageSet {
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self::from_files([path.into()])
    }

    /// Existing image files, one page each, used in place and never deleted.
    pub fn from_files(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pages: paths
                .into_iter()
                .enumerate()
                .map(|(index, path)| PageImage {
                    index,
                    path,
                    temporary: false,
                })
                .collect(),
        }
    }

    fn push_temporary(&mut self, path: PathBuf) {
        self.pages.push(PageImage {
            index: self.pages.len(),
            path,
            temporary: true,
        });
    }

    pub fn pages(&self) -> &[PageImage] {
        &self.pages
    }

    pub fn get(&self, index: usize) -> Option<&PageImage> {
        self.pages.get(index)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn remove_temporary_files(&mut self) {
        for page in self.pages.drain(..).filter(|page| page.temporary) {
            match fs::remove_file(&page.path) {
                Ok(()) => log::trace!("Removed {}", page.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => log::warn!("Failed to remove {}: {err}", page.path.display()),
            }
        }
    }
}

impl Drop for PageSet {
    fn drop(&mut self) {
        self.remove_temporary_files();
    }
}

/// One page handed out by a [`PdfRasterizer`]. `number` is 1-based.
#[derive(Debug)]
pub struct RenderedPage {
    pub number: usize,
    pub count: usize,
    pub image: Result<DynamicImage, RenderError>,
}

/// Renders PDF pages to rasters, in page order.
///
/// Pages are passed to `sink` one at a time; returning `ControlFlow::Break`
/// stops rendering. A page whose raster would exceed `max_pixels` must be
/// reported as [`RenderError::SizeLimit`] instead of being rendered.
pub trait PdfRasterizer: Send + Sync {
    fn rasterize(
        &self,
        path: &Path,
        dpi: u32,
        max_pixels: u64,
        sink: &mut dyn FnMut(RenderedPage) -> ControlFlow<()>,
    ) -> Result<(), RenderError>;
}

/// [`PdfRasterizer`] backed by the pdfium library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    library_path: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the pdfium shared library at `path` instead of the system one.
    pub fn with_library(mut self, path: impl Into<String>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    fn bind(&self) -> Result<Pdfium, RenderError> {
        let bindings = match &self.library_path {
            Some(path) => Pdfium::bind_to_library(path.as_str()),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|err| RenderError::Document(format!("Failed to bind pdfium: {err}")))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfRasterizer for PdfiumRasterizer {
    #[instrument(level = "debug", skip(self, sink))]
    fn rasterize(
        &self,
        path: &Path,
        dpi: u32,
        max_pixels: u64,
        sink: &mut dyn FnMut(RenderedPage) -> ControlFlow<()>,
    ) -> Result<(), RenderError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|err| RenderError::Document(err.to_string()))?;

        let count = document.pages().len() as usize;
        for (i, page) in document.pages().iter().enumerate() {
            let number = i + 1;
            let width = (page.width().value * dpi as f32 / PDF_POINTS_PER_INCH).round() as i32;
            let height = (page.height().value * dpi as f32 / PDF_POINTS_PER_INCH).round() as i32;
            let pixels = width.max(0) as u64 * height.max(0) as u64;

            let image = if pixels > max_pixels {
                Err(RenderError::SizeLimit {
                    page: number,
                    pixels,
                    limit: max_pixels,
                })
            } else {
                let config = PdfRenderConfig::new()
                    .set_target_width(width)
                    .set_target_height(height);
                page.render_with_config(&config)
                    .map(|bitmap| bitmap.as_image())
                    .map_err(|err| RenderError::Page {
                        page: number,
                        message: err.to_string(),
                    })
            };

            if sink(RenderedPage {
                number,
                count,
                image,
            })
            .is_break()
            {
                break;
            }
        }

        Ok(())
    }
}

pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Target size for an image whose longer side exceeds `max_side`, keeping the
/// aspect ratio. `None` if it already fits.
pub fn fit_within(width: u32, height: u32, max_side: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= max_side {
        return None;
    }
    let scale = max_side as f64 / longest as f64;
    let scaled = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, max_side);
    Some((scaled(width), scaled(height)))
}

pub fn downscale(image: DynamicImage, max_side: u32) -> DynamicImage {
    match fit_within(image.width(), image.height(), max_side) {
        Some((width, height)) => {
            log::debug!(
                "Downscaling page from {}x{} to {width}x{height}",
                image.width(),
                image.height()
            );
            image.resize_exact(width, height, FilterType::Lanczos3)
        }
        None => image,
    }
}

/// Turns a source file into the ordered page images recognition runs on.
pub struct DocumentLoader {
    rasterizer: Arc<dyn PdfRasterizer>,
    primary_dpi: u32,
    fallback_dpi: u32,
    max_pixels: u64,
    max_side_len: u32,
    page_failure_policy: PageFailurePolicy,
    temp_dir: PathBuf,
}

impl DocumentLoader {
    pub fn new(config: &PipelineConfig, rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        Self {
            rasterizer,
            primary_dpi: config.primary_dpi,
            fallback_dpi: config.fallback_dpi,
            max_pixels: config.max_pixels,
            max_side_len: config.max_side_len,
            page_failure_policy: config.page_failure_policy,
            temp_dir: config.temp_dir.clone(),
        }
    }

    /// Loads `path`. Single images are used in place; PDFs are rendered to
    /// temporary PNG files which the returned [`PageSet`] owns.
    ///
    /// `cancel` is polled between pages. When it fires, every page written so
    /// far is deleted and [`LoadError::Cancelled`] is returned.
    #[instrument(level = "debug", skip(self, cancel, progress))]
    pub fn load(
        &self,
        path: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<PageSet, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        if !is_pdf(path) {
            if ImageFormat::from_path(path).is_err() {
                return Err(LoadError::Unsupported(path.to_path_buf()));
            }
            fs::metadata(path)?;
            progress(Progress::new(30, "Image loaded"));
            return Ok(PageSet::single(path));
        }

        progress(Progress::new(10, "Converting PDF to images..."));
        match self.convert(path, self.primary_dpi, cancel, progress) {
            Err(LoadError::Render(RenderError::SizeLimit { page, pixels, .. })) => {
                log::warn!(
                    "Page {page} is {pixels} pixels at {} DPI, retrying document at {} DPI",
                    self.primary_dpi,
                    self.fallback_dpi
                );
                progress(Progress::new(
                    10,
                    format!("Page too large, retrying at {} DPI...", self.fallback_dpi),
                ));
                self.convert(path, self.fallback_dpi, cancel, progress)
            }
            result => result,
        }
    }

    /// One rendering attempt. On any failure the partially filled page set is
    /// dropped, which removes the files it already wrote.
    fn convert(
        &self,
        path: &Path,
        dpi: u32,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<PageSet, LoadError> {
        let mut pages = PageSet::default();
        let mut failure = None;

        self.rasterizer
            .rasterize(path, dpi, self.max_pixels, &mut |page| {
                if cancel.is_cancelled() {
                    failure = Some(LoadError::Cancelled);
                    return ControlFlow::Break(());
                }

                let image = match page.image {
                    Ok(image) => image,
                    Err(err @ RenderError::SizeLimit { .. }) => {
                        failure = Some(err.into());
                        return ControlFlow::Break(());
                    }
                    Err(err) if self.page_failure_policy == PageFailurePolicy::Skip => {
                        log::warn!("Skipping page {}: {err}", page.number);
                        return ControlFlow::Continue(());
                    }
                    Err(err) => {
                        failure = Some(err.into());
                        return ControlFlow::Break(());
                    }
                };

                if let Err(err) = self.write_page(&mut pages, image) {
                    failure = Some(err);
                    return ControlFlow::Break(());
                }

                let percent = 10 + (page.number * 30 / page.count.max(1)) as u8;
                progress(Progress::new(
                    percent,
                    format!("Converting page {}/{}...", page.number, page.count),
                ));
                ControlFlow::Continue(())
            })?;

        if let Some(err) = failure {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if pages.is_empty() {
            return Err(LoadError::NoPages);
        }
        Ok(pages)
    }

    fn write_page(&self, pages: &mut PageSet, image: DynamicImage) -> Result<(), LoadError> {
        let (file, path) = tempfile::Builder::new()
            .prefix("scanline-")
            .suffix(&format!("_page_{}.png", pages.len()))
            .tempfile_in(&self.temp_dir)?
            .keep()
            .map_err(|err| err.error)?;
        drop(file);
        pages.push_temporary(path.clone());

        downscale(image, self.max_side_len).save_with_format(&path, ImageFormat::Png)?;
        Ok(())
    }
}
