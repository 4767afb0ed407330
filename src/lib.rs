pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod loader;
pub mod pipeline;
pub mod reconstruct;
pub mod scheduler;
pub mod state;
pub mod word;

pub use config::{PageFailurePolicy, PipelineConfig, PipelineConfigBuilder};
pub use engine::{RapidEngine, RapidEngineBuilder, RecognitionEngine};
#[cfg(feature = "tesseract")]
pub use engine::TesseractEngine;
pub use error::{LoadError, PipelineError, RecognitionError, RenderError};
pub use event::Progress;
pub use loader::{CancelToken, DocumentLoader, PageImage, PageSet, PdfRasterizer, PdfiumRasterizer};
pub use pipeline::{Phase, Pipeline, Update};
pub use reconstruct::{reconstruct, reconstruct_text};
pub use state::{DocumentState, PageRecord};
pub use word::{LineGroup, WordBox};

pub use ort as runtime;
