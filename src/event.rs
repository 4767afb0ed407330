use crate::{error::LoadError, loader::PageSet, word::WordBox};

/// Advisory progress on the overall 0-100% load + recognition scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub label: String,
}

impl Progress {
    pub fn new(percent: u8, label: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            label: label.into(),
        }
    }
}

/// Message sent from a background loader or recognition worker to the
/// pipeline. `generation` identifies the load or run that produced it.
#[derive(Debug)]
pub struct PipelineEvent {
    pub generation: u64,
    pub kind: EventKind,
}

#[derive(Debug)]
pub enum EventKind {
    Progress(Progress),
    Loaded(PageSet),
    LoadFailed(LoadError),
    PageRecognized { index: usize, words: Vec<WordBox> },
    PageFailed { index: usize, message: String },
    RecognitionComplete,
}

impl PipelineEvent {
    pub fn new(generation: u64, kind: EventKind) -> Self {
        Self { generation, kind }
    }
}
