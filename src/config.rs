use std::{path::PathBuf, time::Duration};

/// What to do when a single PDF page fails to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageFailurePolicy {
    /// Fail the whole document.
    #[default]
    Abort,
    /// Log the failure, leave the page out and keep converting.
    Skip,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub primary_dpi: u32,
    pub fallback_dpi: u32,
    /// Largest raster (width * height) a single page may render to.
    pub max_pixels: u64,
    /// Rendered pages are downscaled so neither side exceeds this.
    pub max_side_len: u32,
    pub max_workers: usize,
    pub stop_timeout: Duration,
    pub default_languages: String,
    pub confidence_threshold: u8,
    pub page_failure_policy: PageFailurePolicy,
    pub temp_dir: PathBuf,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Size of the recognition pool: `max_workers`, capped by the cores available.
    pub fn worker_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        self.max_workers.min(cores).max(1)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            primary_dpi: 300,
            fallback_dpi: 150,
            // Twice Pillow's MAX_IMAGE_PIXELS, the point at which it refuses to decode.
            max_pixels: 178_956_970,
            max_side_len: 4000,
            max_workers: 4,
            stop_timeout: Duration::from_secs(3),
            default_languages: "tam+eng".to_string(),
            confidence_threshold: 40,
            page_failure_policy: PageFailurePolicy::Abort,
            temp_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dpi(mut self, primary: u32, fallback: u32) -> Self {
        self.config.primary_dpi = primary;
        self.config.fallback_dpi = fallback;
        self
    }

    pub fn max_pixels(mut self, max_pixels: u64) -> Self {
        self.config.max_pixels = max_pixels;
        self
    }

    pub fn max_side_len(mut self, max_side_len: u32) -> Self {
        self.config.max_side_len = max_side_len;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn default_languages(mut self, languages: impl Into<String>) -> Self {
        self.config.default_languages = languages.into();
        self
    }

    pub fn confidence_threshold(mut self, threshold: u8) -> Self {
        self.config.confidence_threshold = threshold.min(100);
        self
    }

    pub fn page_failure_policy(mut self, policy: PageFailurePolicy) -> Self {
        self.config.page_failure_policy = policy;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_bounded() {
        let config = PipelineConfig::builder().max_workers(64).build();
        assert!(config.worker_count() <= 64);
        assert!(config.worker_count() >= 1);

        let config = PipelineConfig::builder().max_workers(0).build();
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn threshold_is_clamped() {
        let config = PipelineConfig::builder().confidence_threshold(250).build();
        assert_eq!(config.confidence_threshold, 100);
    }
}
