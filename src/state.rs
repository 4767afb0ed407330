use std::borrow::Cow;

use crate::{
    error::PipelineError,
    loader::{PageImage, PageSet},
    reconstruct::{kept_words, reconstruct_text},
    word::WordBox,
};

/// Shown for pages whose recognition has not reported yet.
pub const PENDING_TEXT: &str = "Processing OCR...";

/// Cached recognition state of one page.
#[derive(Debug, Clone, Default)]
pub struct PageRecord {
    words: Option<Vec<WordBox>>,
    reconstructed: Option<String>,
    /// User text overriding `reconstructed`. Present iff the page is edited.
    edit: Option<String>,
    failure: Option<String>,
}

impl PageRecord {
    pub fn words(&self) -> Option<&[WordBox]> {
        self.words.as_deref()
    }

    pub fn reconstructed_text(&self) -> Option<&str> {
        self.reconstructed.as_deref()
    }

    pub fn is_edited(&self) -> bool {
        self.edit.is_some()
    }

    pub fn edited_text(&self) -> Option<&str> {
        self.edit.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// The page's text of record.
    pub fn text(&self) -> Cow<'_, str> {
        match (&self.edit, &self.reconstructed, &self.failure) {
            (Some(edit), _, _) => Cow::Borrowed(edit),
            (None, Some(text), _) => Cow::Borrowed(text),
            (None, None, Some(failure)) => Cow::Owned(format!("[Recognition failed: {failure}]")),
            (None, None, None) => Cow::Borrowed(PENDING_TEXT),
        }
    }

    fn recompute(&mut self, threshold: u8) {
        if let Some(words) = &self.words {
            self.reconstructed = Some(reconstruct_text(words, threshold));
        }
    }
}

/// Pages of the loaded document with their cached recognition results.
///
/// Every page has a record, so any valid page index is a valid record index.
#[derive(Debug)]
pub struct DocumentState {
    pages: PageSet,
    records: Vec<PageRecord>,
    threshold: u8,
    current_page: usize,
}

impl DocumentState {
    pub fn new(pages: PageSet, threshold: u8) -> Self {
        let records = vec![PageRecord::default(); pages.len()];
        Self {
            pages,
            records,
            threshold: threshold.min(100),
            current_page: 0,
        }
    }

    pub fn pages(&self) -> &[PageImage] {
        self.pages.pages()
    }

    pub fn page_count(&self) -> usize {
        self.records.len()
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn record(&self, index: usize) -> Result<&PageRecord, PipelineError> {
        let count = self.page_count();
        self.records
            .get(index)
            .ok_or(PipelineError::PageOutOfRange { index, count })
    }

    fn record_mut(&mut self, index: usize) -> Result<&mut PageRecord, PipelineError> {
        let count = self.page_count();
        self.records
            .get_mut(index)
            .ok_or(PipelineError::PageOutOfRange { index, count })
    }

    /// Stores fresh words for a page and rebuilds its text. An edited page
    /// keeps its edit.
    pub fn on_page_recognized(
        &mut self,
        index: usize,
        words: Vec<WordBox>,
    ) -> Result<(), PipelineError> {
        let threshold = self.threshold;
        let record = self.record_mut(index)?;
        record.words = Some(words);
        record.failure = None;
        record.recompute(threshold);
        Ok(())
    }

    pub fn on_page_failed(&mut self, index: usize, message: String) -> Result<(), PipelineError> {
        self.record_mut(index)?.failure = Some(message);
        Ok(())
    }

    /// Changes the threshold and rebuilds the text of every unedited page
    /// that has words.
    pub fn set_threshold(&mut self, threshold: u8) {
        self.threshold = threshold.min(100);
        for record in self.records.iter_mut().filter(|record| !record.is_edited()) {
            record.recompute(self.threshold);
        }
    }

    pub fn edit_text(&mut self, index: usize, text: impl Into<String>) -> Result<(), PipelineError> {
        self.record_mut(index)?.edit = Some(text.into());
        Ok(())
    }

    /// Drops the user's edit and goes back to the reconstruction under the
    /// current threshold.
    pub fn reset_edit(&mut self, index: usize) -> Result<(), PipelineError> {
        let threshold = self.threshold;
        let record = self.record_mut(index)?;
        record.edit = None;
        record.recompute(threshold);
        Ok(())
    }

    pub fn text_of(&self, index: usize) -> Result<Cow<'_, str>, PipelineError> {
        Ok(self.record(index)?.text())
    }

    /// Words of a page that pass the current threshold, for highlighting.
    pub fn highlights(&self, index: usize) -> Result<Vec<&WordBox>, PipelineError> {
        let record = self.record(index)?;
        Ok(record
            .words()
            .map(|words| kept_words(words, self.threshold).collect())
            .unwrap_or_default())
    }

    /// Every page's text of record under a `=== Page n ===` header.
    pub fn export_all(&self) -> String {
        self.records
            .iter()
            .enumerate()
            .map(|(i, record)| format!("=== Page {} ===\n{}\n", i + 1, record.text()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Forgets all recognition results and edits, ahead of a rerun.
    pub fn clear_results(&mut self) {
        self.records.fill(PageRecord::default());
    }

    pub fn is_complete(&self) -> bool {
        self.records
            .iter()
            .all(|record| record.words.is_some() || record.failure.is_some())
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn set_current_page(&mut self, index: usize) -> Result<(), PipelineError> {
        self.record(index)?;
        self.current_page = index;
        Ok(())
    }

    pub fn next_page(&mut self) -> usize {
        if self.current_page + 1 < self.page_count() {
            self.current_page += 1;
        }
        self.current_page
    }

    pub fn prev_page(&mut self) -> usize {
        self.current_page = self.current_page.saturating_sub(1);
        self.current_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::LineGroup;

    fn word(text: &str, confidence: f32, line: i32) -> WordBox {
        WordBox::new(
            text,
            confidence,
            LineGroup {
                block: 1,
                paragraph: 1,
                line,
            },
        )
    }

    fn sample_words() -> Vec<WordBox> {
        vec![
            word("Hello", 90.0, 1),
            word("faint", 45.0, 1),
            word("World", 80.0, 2),
        ]
    }

    fn state(pages: usize) -> DocumentState {
        let dir = std::env::temp_dir();
        let set = PageSet::from_files((0..pages).map(|i| dir.join(format!("page-{i}.png"))));
        DocumentState::new(set, 40)
    }

    #[test]
    fn pending_then_recognized() {
        let mut state = state(1);
        assert_eq!(state.text_of(0).unwrap(), PENDING_TEXT);

        state.on_page_recognized(0, sample_words()).unwrap();
        assert_eq!(state.text_of(0).unwrap(), "Hello faint\nWorld");
    }

    #[test]
    fn threshold_rebuilds_unedited_pages() {
        let mut state = state(2);
        state.on_page_recognized(0, sample_words()).unwrap();
        state.on_page_recognized(1, sample_words()).unwrap();

        state.set_threshold(50);
        assert_eq!(state.text_of(0).unwrap(), "Hello\nWorld");
        assert_eq!(state.text_of(1).unwrap(), "Hello\nWorld");

        state.set_threshold(85);
        assert_eq!(state.text_of(0).unwrap(), "Hello");
    }

    #[test]
    fn edits_survive_threshold_and_results() {
        let mut state = state(1);
        state.on_page_recognized(0, sample_words()).unwrap();
        state.edit_text(0, "custom").unwrap();

        state.set_threshold(10);
        assert_eq!(state.text_of(0).unwrap(), "custom");

        state.on_page_recognized(0, vec![word("Other", 99.0, 1)]).unwrap();
        assert_eq!(state.text_of(0).unwrap(), "custom");
        assert!(state.record(0).unwrap().is_edited());
        assert_eq!(state.record(0).unwrap().words().unwrap()[0].text, "Other");
    }

    #[test]
    fn reset_restores_current_reconstruction() {
        let mut state = state(1);
        state.on_page_recognized(0, sample_words()).unwrap();
        state.edit_text(0, "custom").unwrap();
        state.set_threshold(50);

        state.reset_edit(0).unwrap();
        assert!(!state.record(0).unwrap().is_edited());
        assert_eq!(state.record(0).unwrap().edited_text(), None);
        assert_eq!(state.text_of(0).unwrap(), "Hello\nWorld");
    }

    #[test]
    fn failure_is_isolated_to_its_page() {
        let mut state = state(3);
        state.on_page_recognized(0, sample_words()).unwrap();
        state.on_page_failed(2, "engine exploded".into()).unwrap();
        state.on_page_recognized(1, vec![word("B", 99.0, 1)]).unwrap();

        assert_eq!(state.text_of(0).unwrap(), "Hello faint\nWorld");
        assert_eq!(state.text_of(1).unwrap(), "B");
        assert_eq!(
            state.text_of(2).unwrap(),
            "[Recognition failed: engine exploded]"
        );
        assert!(state.is_complete());
    }

    #[test]
    fn export_covers_every_page() {
        let mut state = state(2);
        state.on_page_recognized(0, vec![word("A", 99.0, 1)]).unwrap();
        state.on_page_recognized(1, vec![word("x", 99.0, 1)]).unwrap();
        state.edit_text(1, "B").unwrap();

        assert_eq!(state.export_all(), "=== Page 1 ===\nA\n\n=== Page 2 ===\nB\n");
    }

    #[test]
    fn clear_results_resets_edits() {
        let mut state = state(1);
        state.on_page_recognized(0, sample_words()).unwrap();
        state.edit_text(0, "custom").unwrap();

        state.clear_results();
        assert!(!state.record(0).unwrap().is_edited());
        assert_eq!(state.text_of(0).unwrap(), PENDING_TEXT);
        assert!(!state.is_complete());
    }

    #[test]
    fn highlights_follow_threshold() {
        let mut state = state(1);
        assert!(state.highlights(0).unwrap().is_empty());
        state.on_page_recognized(0, sample_words()).unwrap();
        assert_eq!(state.highlights(0).unwrap().len(), 3);
        state.set_threshold(85);
        let kept = state.highlights(0).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text, "Hello");
    }

    #[test]
    fn out_of_range_pages_are_rejected() {
        let mut state = state(2);
        assert!(matches!(
            state.edit_text(2, "x"),
            Err(PipelineError::PageOutOfRange { index: 2, count: 2 })
        ));
        assert!(state.text_of(5).is_err());
        assert!(state.set_current_page(2).is_err());
    }

    #[test]
    fn navigation_is_clamped() {
        let mut state = state(3);
        assert_eq!(state.prev_page(), 0);
        assert_eq!(state.next_page(), 1);
        assert_eq!(state.next_page(), 2);
        assert_eq!(state.next_page(), 2);
        state.set_current_page(0).unwrap();
        assert_eq!(state.current_page(), 0);
    }
}
