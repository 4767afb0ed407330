use geo::Polygon;

#[derive(Debug, Clone)]
pub struct TextBox {
    pub score: f32,
    pub rect: Polygon<f32>,
}

/// One character decoded from the recognizer, with the CTC time step it was
/// emitted at.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedChar {
    pub text: String,
    pub score: f32,
    pub step: usize,
}

/// Decoded output for one cropped line image. `steps` is the number of CTC
/// time steps, which span the crop's width evenly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextLine {
    pub chars: Vec<RecognizedChar>,
    pub steps: usize,
}

/// A whitespace-delimited run of characters, positioned as fractions of the
/// line crop's width.
#[derive(Debug, Clone, PartialEq)]
pub struct WordSpan {
    pub text: String,
    /// Mean character score, 0-100.
    pub confidence: f32,
    pub start: f32,
    pub end: f32,
}

impl TextLine {
    pub fn text(&self) -> String {
        self.chars.iter().map(|c| c.text.as_str()).collect()
    }

    pub fn words(&self) -> Vec<WordSpan> {
        let steps = self.steps.max(1) as f32;
        self.chars
            .split(|c| c.text.trim().is_empty())
            .filter(|word| !word.is_empty())
            .map(|word| {
                let score = word.iter().map(|c| c.score).sum::<f32>() / word.len() as f32;
                let first = word.first().map_or(0, |c| c.step);
                let last = word.last().map_or(0, |c| c.step);
                WordSpan {
                    text: word.iter().map(|c| c.text.as_str()).collect(),
                    confidence: score * 100.0,
                    start: first as f32 / steps,
                    end: ((last + 1) as f32 / steps).min(1.0),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Angle {
    pub index: usize,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(chars: &[(&str, f32, usize)], steps: usize) -> TextLine {
        TextLine {
            chars: chars
                .iter()
                .map(|(text, score, step)| RecognizedChar {
                    text: text.to_string(),
                    score: *score,
                    step: *step,
                })
                .collect(),
            steps,
        }
    }

    #[test]
    fn splits_on_spaces() {
        let line = line(
            &[
                ("h", 0.9, 0),
                ("i", 0.7, 2),
                (" ", 0.99, 4),
                (" ", 0.99, 5),
                ("y", 0.5, 6),
                ("o", 0.5, 9),
            ],
            10,
        );
        assert_eq!(line.text(), "hi  yo");

        let words = line.words();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "hi");
        assert!((words[0].confidence - 80.0).abs() < 1e-3);
        assert_eq!((words[0].start, words[0].end), (0.0, 0.3));
        assert_eq!(words[1].text, "yo");
        assert_eq!((words[1].start, words[1].end), (0.6, 1.0));
    }

    #[test]
    fn empty_line_has_no_words() {
        assert!(TextLine::default().words().is_empty());
        assert!(line(&[(" ", 0.9, 0)], 4).words().is_empty());
    }
}
