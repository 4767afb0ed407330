use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::instrument;

use crate::{
    engine::{resolve_languages, RecognitionEngine},
    error::RecognitionError,
    event::{EventKind, PipelineEvent, Progress},
    loader::PageImage,
    word::WordBox,
};

/// Start of the recognition band on the overall progress scale.
const OCR_PROGRESS_START: usize = 40;
const OCR_PROGRESS_SPAN: usize = 60;

/// Overall progress once `completed` of `total` pages have finished.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (OCR_PROGRESS_START + completed.min(total) * OCR_PROGRESS_SPAN / total) as u8
}

#[derive(Debug, Clone)]
struct PageJob {
    index: usize,
    path: PathBuf,
}

/// State shared by the workers of one run.
struct RunShared {
    generation: u64,
    total: usize,
    completed: AtomicUsize,
    stopped: AtomicBool,
    languages: String,
    engine: Arc<dyn RecognitionEngine>,
    events: Sender<PipelineEvent>,
}

impl RunShared {
    fn send(&self, kind: EventKind) {
        // The receiver only goes away when the pipeline is dropped.
        let _ = self.events.send(PipelineEvent::new(self.generation, kind));
    }
}

struct ActiveRun {
    shared: Arc<RunShared>,
    queue: Receiver<PageJob>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size worker pool running one recognition job per page, all queued at
/// once. Started engine calls are never interrupted: a job outliving
/// [`stop`](Self::stop) still reports, under its old generation.
pub struct PageOcrScheduler {
    engine: Arc<dyn RecognitionEngine>,
    workers: usize,
    stop_timeout: Duration,
    default_languages: String,
    active: Option<ActiveRun>,
}

impl PageOcrScheduler {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        workers: usize,
        stop_timeout: Duration,
        default_languages: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            stop_timeout,
            default_languages: default_languages.into(),
            active: None,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Whether the current run still has queued or running jobs.
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|run| {
            run.shared.completed.load(Ordering::SeqCst) < run.shared.total
                && !run.shared.stopped.load(Ordering::SeqCst)
        })
    }

    /// Queues one job per page and starts the pool. Any previous run is
    /// stopped first.
    ///
    /// Emits a 40% progress event, then per page a `PageRecognized` or
    /// `PageFailed` followed by a progress event, then `RecognitionComplete`
    /// exactly once after the last page. With no pages the run completes
    /// immediately.
    #[instrument(level = "debug", skip(self, pages, events))]
    pub fn start(
        &mut self,
        generation: u64,
        pages: &[PageImage],
        languages: &str,
        events: Sender<PipelineEvent>,
    ) {
        self.stop();

        let shared = Arc::new(RunShared {
            generation,
            total: pages.len(),
            completed: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            languages: resolve_languages(languages, &self.default_languages).to_string(),
            engine: self.engine.clone(),
            events,
        });

        shared.send(EventKind::Progress(Progress::new(
            OCR_PROGRESS_START as u8,
            "Starting OCR processing...",
        )));
        if pages.is_empty() {
            shared.send(EventKind::RecognitionComplete);
            return;
        }

        let (queue_tx, queue) = crossbeam_channel::unbounded();
        for page in pages {
            let _ = queue_tx.send(PageJob {
                index: page.index,
                path: page.path.clone(),
            });
        }
        drop(queue_tx);

        let workers = (0..self.workers.min(pages.len()))
            .filter_map(|i| {
                let shared = shared.clone();
                let queue = queue.clone();
                thread::Builder::new()
                    .name(format!("ocr-worker-{i}"))
                    .spawn(move || worker_loop(&shared, &queue))
                    .map_err(|err| log::error!("Failed to spawn OCR worker: {err}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        if workers.is_empty() {
            // Without workers every page fails rather than the run hanging.
            for job in queue.try_iter() {
                finish_job(
                    &shared,
                    job.index,
                    Err(RecognitionError::Engine("No OCR worker available".into())),
                );
            }
        }

        log::debug!(
            "Run {generation}: {} pages on {} {} workers",
            pages.len(),
            workers.len(),
            self.engine.name()
        );
        self.active = Some(ActiveRun {
            shared,
            queue,
            workers,
        });
    }

    /// Discards queued jobs and waits up to the stop timeout for running ones.
    pub fn stop(&mut self) {
        let Some(run) = self.active.take() else {
            return;
        };

        run.shared.stopped.store(true, Ordering::SeqCst);
        let discarded = run.queue.try_iter().count();
        if discarded > 0 {
            log::debug!(
                "Run {}: discarded {discarded} queued pages",
                run.shared.generation
            );
        }

        let deadline = Instant::now() + self.stop_timeout;
        while run.workers.iter().any(|worker| !worker.is_finished()) {
            if Instant::now() >= deadline {
                log::warn!(
                    "Run {}: recognition still running after {:?}, leaving it to finish in the background",
                    run.shared.generation,
                    self.stop_timeout
                );
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }

        for worker in run.workers {
            if worker.join().is_err() {
                log::error!("OCR worker panicked");
            }
        }
    }
}

impl Drop for PageOcrScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &RunShared, queue: &Receiver<PageJob>) {
    while let Ok(job) = queue.recv() {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let result = recognize_page(shared, &job);
        finish_job(shared, job.index, result);
    }
}

fn recognize_page(shared: &RunShared, job: &PageJob) -> Result<Vec<WordBox>, RecognitionError> {
    let image = image::open(&job.path)?;
    panic::catch_unwind(AssertUnwindSafe(|| {
        shared.engine.recognize(&image, &shared.languages)
    }))
    .unwrap_or(Err(RecognitionError::Panicked))
}

fn finish_job(shared: &RunShared, index: usize, result: Result<Vec<WordBox>, RecognitionError>) {
    match result {
        Ok(words) => {
            log::debug!("Page {}: {} words", index + 1, words.len());
            shared.send(EventKind::PageRecognized { index, words });
        }
        Err(err) => {
            log::warn!("OCR error on page {}: {err}", index + 1);
            shared.send(EventKind::PageFailed {
                index,
                message: err.to_string(),
            });
        }
    }

    let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
    shared.send(EventKind::Progress(Progress::new(
        progress_percent(completed, shared.total),
        format!("Processed page {completed}/{}", shared.total),
    )));
    if completed == shared.total {
        shared.send(EventKind::RecognitionComplete);
    }
}
