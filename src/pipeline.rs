use std::{
    borrow::Cow,
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::instrument;

use crate::{
    config::PipelineConfig,
    engine::RecognitionEngine,
    error::{LoadError, PipelineError},
    event::{EventKind, PipelineEvent, Progress},
    loader::{CancelToken, DocumentLoader, PdfRasterizer},
    scheduler::PageOcrScheduler,
    state::DocumentState,
};

/// What the pipeline is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Recognizing,
}

/// Notification for the presentation layer, produced while applying events.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Progress(Progress),
    DocumentLoaded { pages: usize },
    PageUpdated(usize),
    PageFailed { index: usize, message: String },
    LoadFailed(String),
    LoadCancelled,
    RecognitionComplete,
}

struct LoadTask {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Owns the document and applies events from the loader thread and the
/// recognition workers when polled. Events from an older load or run
/// generation are dropped.
pub struct Pipeline {
    loader: Arc<DocumentLoader>,
    scheduler: PageOcrScheduler,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    generation: u64,
    phase: Phase,
    threshold: u8,
    languages: String,
    stop_timeout: Duration,
    document: Option<DocumentState>,
    load_task: Option<LoadTask>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        engine: Arc<dyn RecognitionEngine>,
        rasterizer: Arc<dyn PdfRasterizer>,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let scheduler = PageOcrScheduler::new(
            engine,
            config.worker_count(),
            config.stop_timeout,
            config.default_languages.clone(),
        );
        Self {
            loader: Arc::new(DocumentLoader::new(&config, rasterizer)),
            scheduler,
            events_tx,
            events_rx,
            generation: 0,
            phase: Phase::Idle,
            threshold: config.confidence_threshold,
            languages: config.default_languages.clone(),
            stop_timeout: config.stop_timeout,
            document: None,
            load_task: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True while a load or recognition run is in progress.
    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn document(&self) -> Option<&DocumentState> {
        self.document.as_ref()
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn languages(&self) -> &str {
        &self.languages
    }

    /// Language set for subsequent runs. Blank means the configured default.
    pub fn set_languages(&mut self, languages: impl Into<String>) {
        self.languages = languages.into();
    }

    /// Replaces the current document with `path`, converting it in the
    /// background. Recognition starts automatically once the pages are ready.
    #[instrument(skip(self))]
    pub fn load(&mut self, path: impl AsRef<Path> + std::fmt::Debug) {
        self.halt();
        self.document = None;

        self.generation += 1;
        self.phase = Phase::Loading;

        let generation = self.generation;
        let path = path.as_ref().to_path_buf();
        let loader = self.loader.clone();
        let events = self.events_tx.clone();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name("document-loader".to_string())
            .spawn(move || run_load(&loader, &path, &worker_cancel, generation, &events));

        match spawned {
            Ok(handle) => self.load_task = Some(LoadTask { cancel, handle }),
            Err(err) => {
                let _ = self.events_tx.send(PipelineEvent::new(
                    generation,
                    EventKind::LoadFailed(LoadError::Io(err)),
                ));
            }
        }
    }

    /// Stops an in-progress load. Pages already written are removed, including
    /// a finished page set still waiting in the queue.
    pub fn cancel_load(&mut self) {
        if self.phase == Phase::Loading {
            self.stop_load();
            self.generation += 1;
            self.phase = Phase::Idle;
            self.events_rx.try_iter().for_each(drop);
        }
    }

    /// Clears every cached result and edit, then recognizes all pages again.
    /// A run still in progress is stopped first.
    #[instrument(skip(self))]
    pub fn rerun(&mut self) -> Result<(), PipelineError> {
        if self.phase == Phase::Loading {
            return Err(PipelineError::Busy);
        }
        if self.document.is_none() {
            return Err(PipelineError::NoDocument);
        }

        self.scheduler.stop();
        if let Some(document) = self.document.as_mut() {
            document.clear_results();
        }
        self.start_recognition();
        Ok(())
    }

    fn start_recognition(&mut self) {
        let Some(document) = &self.document else {
            return;
        };
        self.generation += 1;
        self.phase = Phase::Recognizing;
        self.scheduler.start(
            self.generation,
            document.pages(),
            &self.languages,
            self.events_tx.clone(),
        );
    }

    pub fn set_threshold(&mut self, threshold: u8) {
        self.threshold = threshold.min(100);
        if let Some(document) = self.document.as_mut() {
            document.set_threshold(self.threshold);
        }
    }

    pub fn edit_text(&mut self, index: usize, text: impl Into<String>) -> Result<(), PipelineError> {
        self.document_mut()?.edit_text(index, text)
    }

    pub fn reset_edit(&mut self, index: usize) -> Result<(), PipelineError> {
        self.document_mut()?.reset_edit(index)
    }

    pub fn text_of(&self, index: usize) -> Result<Cow<'_, str>, PipelineError> {
        self.document
            .as_ref()
            .ok_or(PipelineError::NoDocument)?
            .text_of(index)
    }

    pub fn set_current_page(&mut self, index: usize) -> Result<(), PipelineError> {
        self.document_mut()?.set_current_page(index)
    }

    pub fn next_page(&mut self) -> Result<usize, PipelineError> {
        Ok(self.document_mut()?.next_page())
    }

    pub fn prev_page(&mut self) -> Result<usize, PipelineError> {
        Ok(self.document_mut()?.prev_page())
    }

    pub fn export_all(&self) -> Result<String, PipelineError> {
        Ok(self
            .document
            .as_ref()
            .ok_or(PipelineError::NoDocument)?
            .export_all())
    }

    pub fn export_to(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let text = self.export_all()?;
        std::fs::write(path.as_ref(), text)?;
        log::info!("Text exported to {}", path.as_ref().display());
        Ok(())
    }

    fn document_mut(&mut self) -> Result<&mut DocumentState, PipelineError> {
        self.document.as_mut().ok_or(PipelineError::NoDocument)
    }

    /// Applies every event already queued, without blocking.
    pub fn poll(&mut self) -> Vec<Update> {
        let pending = self.events_rx.try_iter().collect::<Vec<_>>();
        pending
            .into_iter()
            .filter_map(|event| self.apply(event))
            .collect()
    }

    /// Waits up to `timeout` for the next event from the current generation
    /// and applies it.
    pub fn next_update(&mut self, timeout: Duration) -> Option<Update> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(remaining) {
                Ok(event) => {
                    if let Some(update) = self.apply(event) {
                        return Some(update);
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Applies events until nothing is loading or recognizing, returning the
    /// updates produced along the way.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<Vec<Update>, PipelineError> {
        let deadline = Instant::now() + timeout;
        let mut updates = Vec::new();
        while self.is_busy() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PipelineError::Timeout);
            }
            updates.extend(self.next_update(remaining));
        }
        Ok(updates)
    }

    fn apply(&mut self, event: PipelineEvent) -> Option<Update> {
        if event.generation != self.generation {
            log::debug!(
                "Dropping event from generation {} (current {})",
                event.generation,
                self.generation
            );
            return None;
        }

        match event.kind {
            EventKind::Progress(progress) => Some(Update::Progress(progress)),
            EventKind::Loaded(pages) => {
                self.join_load();
                let count = pages.len();
                self.document = Some(DocumentState::new(pages, self.threshold));
                self.start_recognition();
                Some(Update::DocumentLoaded { pages: count })
            }
            EventKind::LoadFailed(LoadError::Cancelled) => {
                self.join_load();
                self.phase = Phase::Idle;
                Some(Update::LoadCancelled)
            }
            EventKind::LoadFailed(err) => {
                self.join_load();
                self.phase = Phase::Idle;
                log::error!("Load failed: {err}");
                Some(Update::LoadFailed(err.to_string()))
            }
            EventKind::PageRecognized { index, words } => {
                let document = self.document.as_mut()?;
                match document.on_page_recognized(index, words) {
                    Ok(()) => Some(Update::PageUpdated(index)),
                    Err(err) => {
                        log::warn!("Ignoring result: {err}");
                        None
                    }
                }
            }
            EventKind::PageFailed { index, message } => {
                let document = self.document.as_mut()?;
                match document.on_page_failed(index, message.clone()) {
                    Ok(()) => Some(Update::PageFailed { index, message }),
                    Err(err) => {
                        log::warn!("Ignoring failure: {err}");
                        None
                    }
                }
            }
            EventKind::RecognitionComplete => {
                self.phase = Phase::Idle;
                Some(Update::RecognitionComplete)
            }
        }
    }

    fn join_load(&mut self) {
        if let Some(task) = self.load_task.take() {
            if task.handle.join().is_err() {
                log::error!("Document loader panicked");
            }
        }
    }

    /// Cancels the load thread and waits a bounded time for it to clean up.
    fn stop_load(&mut self) {
        let Some(task) = self.load_task.take() else {
            return;
        };
        task.cancel.cancel();

        let deadline = Instant::now() + self.stop_timeout;
        while !task.handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("Document loader still busy after {:?}", self.stop_timeout);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if task.handle.join().is_err() {
            log::error!("Document loader panicked");
        }
    }

    /// Stops background work. Late events are invalidated by the generation bump.
    fn halt(&mut self) {
        self.stop_load();
        self.scheduler.stop();
        self.generation += 1;
        self.phase = Phase::Idle;
    }

    /// Stops all work and discards the document, removing its temporary files.
    pub fn shutdown(&mut self) {
        self.halt();
        self.document = None;
        // Drop queued events now so any page sets they carry are cleaned up.
        self.events_rx.try_iter().for_each(drop);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_load(
    loader: &DocumentLoader,
    path: &Path,
    cancel: &CancelToken,
    generation: u64,
    events: &Sender<PipelineEvent>,
) {
    let send = |kind| {
        // A closed channel means the pipeline is gone; dropping the event
        // still cleans up any page files it holds.
        let _ = events.send(PipelineEvent::new(generation, kind));
    };

    let result = loader.load(path, cancel, &mut |progress| {
        send(EventKind::Progress(progress))
    });
    match result {
        Ok(pages) => send(EventKind::Loaded(pages)),
        Err(err) => send(EventKind::LoadFailed(err)),
    }
}
