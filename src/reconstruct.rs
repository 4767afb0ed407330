use crate::word::{LineGroup, WordBox};

/// Words that survive `threshold`, in engine order.
pub fn kept_words(words: &[WordBox], threshold: u8) -> impl Iterator<Item = &WordBox> {
    words.iter().filter(move |word| word.passes(threshold))
}

/// Rebuilds text lines from engine-ordered words.
///
/// A line break happens whenever the reading-order group of the next kept word
/// differs from the previous kept word. Positions are not consulted, so the
/// result is only as well ordered as the engine's output.
pub fn reconstruct(words: &[WordBox], threshold: u8) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut last_group: Option<LineGroup> = None;

    for word in kept_words(words, threshold) {
        let group = word.group();
        if last_group != Some(group) {
            if !current.is_empty() {
                lines.push(current.join(" "));
                current.clear();
            }
            last_group = Some(group);
        }
        current.push(word.text.trim());
    }

    if !current.is_empty() {
        lines.push(current.join(" "));
    }

    lines
}

/// [`reconstruct`] joined into the page text shown to the user.
pub fn reconstruct_text(words: &[WordBox], threshold: u8) -> String {
    reconstruct(words, threshold).join("\n")
}
