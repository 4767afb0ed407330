use std::path::PathBuf;

use thiserror::Error;

/// Failure to turn a source file into page images. Fatal to the load attempt.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Unsupported file type: {0}")]
    Unsupported(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write page image: {0}")]
    Image(#[from] image::ImageError),

    #[error("PDF conversion error: {0}")]
    Render(#[from] RenderError),

    #[error("No pages found in PDF")]
    NoPages,

    #[error("Load cancelled")]
    Cancelled,
}

/// Failure reported by a [`PdfRasterizer`](crate::loader::PdfRasterizer).
#[derive(Error, Debug, Clone)]
pub enum RenderError {
    /// The raster for `page` would exceed the configured pixel-count limit.
    #[error("Page {page} would be {pixels} pixels, exceeding the limit of {limit}")]
    SizeLimit { page: usize, pixels: u64, limit: u64 },

    #[error("Failed to open PDF: {0}")]
    Document(String),

    #[error("Failed to render page {page}: {message}")]
    Page { page: usize, message: String },
}

/// Failure of the recognition engine for a single page.
#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Failed to read page image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to initialize recognition engine: {0}")]
    Init(String),

    #[error("{0}")]
    Engine(String),

    #[error("Recognition engine panicked")]
    Panicked,
}

impl From<ort::Error> for RecognitionError {
    fn from(err: ort::Error) -> Self {
        Self::Engine(err.to_string())
    }
}

/// Errors returned by coordinator and document-state operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("A document is still loading")]
    Busy,

    #[error("No document loaded")]
    NoDocument,

    #[error("Page {index} is out of range (document has {count} pages)")]
    PageOutOfRange { index: usize, count: usize },

    #[error("Timed out waiting for the pipeline to become idle")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
