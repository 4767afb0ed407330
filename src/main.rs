use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use scanline::{
    PdfiumRasterizer, Pipeline, PipelineConfig, RapidEngineBuilder, RecognitionEngine, Update,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineKind {
    Rapid,
    Tesseract,
}

/// Extract text from a scanned PDF or image.
#[derive(Parser)]
#[command(name = "scanline", version)]
struct Cli {
    /// PDF or image file to read.
    file: PathBuf,

    /// Minimum word confidence (0-100) kept in the output.
    #[arg(long, default_value_t = 40)]
    threshold: u8,

    /// Language set passed to the engine, e.g. "tam+eng".
    #[arg(long)]
    lang: Option<String>,

    #[arg(long, value_enum, default_value_t = EngineKind::Rapid)]
    engine: EngineKind,

    /// Directory with det.onnx, rec.onnx, keys.txt and optionally cls.onnx.
    #[arg(long, default_value = "models")]
    models: PathBuf,

    /// Tesseract data directory.
    #[cfg_attr(not(feature = "tesseract"), allow(dead_code))]
    #[arg(long)]
    tessdata: Option<String>,

    /// Path to the pdfium shared library. Defaults to the system library.
    #[arg(long)]
    pdfium: Option<String>,

    /// Write the text here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Upper bound on parallel recognition workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn build_engine(cli: &Cli) -> Result<Arc<dyn RecognitionEngine>, Box<dyn Error>> {
    let engine: Arc<dyn RecognitionEngine> = match cli.engine {
        EngineKind::Rapid => Arc::new(RapidEngineBuilder::new().model_dir(&cli.models).build()?),
        #[cfg(feature = "tesseract")]
        EngineKind::Tesseract => {
            let mut engine = scanline::TesseractEngine::new();
            if let Some(path) = &cli.tessdata {
                engine = engine.data_path(path.clone());
            }
            Arc::new(engine)
        }
        #[cfg(not(feature = "tesseract"))]
        EngineKind::Tesseract => {
            return Err("scanline was built without the `tesseract` feature".into())
        }
    };
    Ok(engine)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::builder()
        .confidence_threshold(cli.threshold)
        .max_workers(cli.workers);
    if let Some(lang) = &cli.lang {
        config = config.default_languages(lang.clone());
    }

    let engine = build_engine(&cli)?;
    let rasterizer = match &cli.pdfium {
        Some(path) => PdfiumRasterizer::new().with_library(path.clone()),
        None => PdfiumRasterizer::new(),
    };

    let mut pipeline = Pipeline::new(config.build(), engine, Arc::new(rasterizer));
    pipeline.load(&cli.file);

    while pipeline.is_busy() {
        let Some(update) = pipeline.next_update(Duration::from_millis(500)) else {
            continue;
        };
        match update {
            Update::Progress(progress) => {
                log::info!("[{:>3}%] {}", progress.percent, progress.label)
            }
            Update::DocumentLoaded { pages } => log::info!("Loaded {pages} page(s)"),
            Update::PageUpdated(index) => log::debug!("Page {} recognized", index + 1),
            Update::PageFailed { index, message } => {
                log::warn!("Page {} failed: {message}", index + 1)
            }
            Update::LoadFailed(message) => return Err(message.into()),
            Update::LoadCancelled => return Err("Load cancelled".into()),
            Update::RecognitionComplete => log::info!("OCR complete"),
        }
    }

    match &cli.output {
        Some(path) => pipeline.export_to(path)?,
        None => print!("{}", pipeline.export_all()?),
    }
    Ok(())
}
