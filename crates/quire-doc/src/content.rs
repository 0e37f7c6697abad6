//! Structural units of a document and the rich-text tree derived from them.
//!
//! A document is a sequence of units: characters, block terminators and
//! image embeds. A `Break` closes the block before it and carries that
//! block's kind, so paragraphs, headings, list items and task items are all
//! expressed in the same replicated sequence.

use serde::{Deserialize, Serialize};

/// Placeholder character used for embeds in the plain-text view.
pub const OBJECT_REPLACEMENT: char = '\u{FFFC}';

/// Maximum heading level accepted by the editor.
pub const MAX_HEADING_LEVEL: u8 = 6;

/// The kind of a block.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Paragraph,
    /// Heading, level 1..=6.
    Heading { level: u8 },
    BulletItem,
    OrderedItem,
    TaskItem { checked: bool },
}

impl BlockKind {
    /// Clamp out-of-range heading levels.
    pub fn normalized(self) -> Self {
        match self {
            BlockKind::Heading { level } => BlockKind::Heading {
                level: level.clamp(1, MAX_HEADING_LEVEL),
            },
            other => other,
        }
    }
}

/// An image reference. Storage of the image itself is handled elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
    pub src: String,
    pub alt: String,
}

impl Image {
    pub fn new(src: impl Into<String>, alt: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            alt: alt.into(),
        }
    }
}

/// One unit of the replicated sequence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Content {
    Char(char),
    Break(BlockKind),
    Image(Image),
}

impl Content {
    /// Convert a string into units. Newlines become paragraph breaks.
    pub fn from_text(text: &str) -> Vec<Content> {
        text.chars()
            .map(|ch| match ch {
                '\n' => Content::Break(BlockKind::Paragraph),
                ch => Content::Char(ch),
            })
            .collect()
    }

    /// The character this unit contributes to the plain-text view.
    pub fn as_char(&self) -> char {
        match self {
            Content::Char(ch) => *ch,
            Content::Break(_) => '\n',
            Content::Image(_) => OBJECT_REPLACEMENT,
        }
    }
}

/// Inline formatting.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarkKind {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
    Link { url: String },
    Highlight { color: String },
}

impl MarkKind {
    /// Whether two marks of these kinds cannot both apply to one character.
    ///
    /// Only parameterized marks conflict with each other; the mark with the
    /// greater id wins.
    pub fn conflicts_with(&self, other: &MarkKind) -> bool {
        matches!(
            (self, other),
            (MarkKind::Link { .. }, MarkKind::Link { .. })
                | (MarkKind::Highlight { .. }, MarkKind::Highlight { .. })
        )
    }
}

/// A run of inline content inside a block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Inline {
    Text { text: String, marks: Vec<MarkKind> },
    Image(Image),
}

/// A block of the derived document tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    pub kind: BlockKind,
    pub children: Vec<Inline>,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    /// Append a character, extending the last text run when its marks match.
    pub(crate) fn push_char(&mut self, ch: char, marks: Vec<MarkKind>) {
        if let Some(Inline::Text { text, marks: last }) = self.children.last_mut() {
            if *last == marks {
                text.push(ch);
                return;
            }
        }
        self.children.push(Inline::Text {
            text: ch.to_string(),
            marks,
        });
    }

    /// Plain text of this block.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .map(|inline| match inline {
                Inline::Text { text, .. } => text.clone(),
                Inline::Image(_) => OBJECT_REPLACEMENT.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_text_maps_newlines() {
        let units = Content::from_text("a\nb");
        assert_eq!(
            units,
            vec![
                Content::Char('a'),
                Content::Break(BlockKind::Paragraph),
                Content::Char('b'),
            ]
        );
    }

    #[test]
    fn test_heading_level_clamped() {
        assert_eq!(
            BlockKind::Heading { level: 9 }.normalized(),
            BlockKind::Heading { level: 6 }
        );
        assert_eq!(
            BlockKind::Heading { level: 0 }.normalized(),
            BlockKind::Heading { level: 1 }
        );
    }

    #[test]
    fn test_mark_conflicts() {
        let a = MarkKind::Link {
            url: "https://a".into(),
        };
        let b = MarkKind::Link {
            url: "https://b".into(),
        };
        assert!(a.conflicts_with(&b));
        assert!(!MarkKind::Bold.conflicts_with(&MarkKind::Bold));
        assert!(!MarkKind::Bold.conflicts_with(&a));
    }

    #[test]
    fn test_push_char_merges_runs() {
        let mut block = Block::new(BlockKind::Paragraph);
        block.push_char('a', vec![]);
        block.push_char('b', vec![]);
        block.push_char('c', vec![MarkKind::Bold]);

        assert_eq!(block.children.len(), 2);
        assert_eq!(block.text(), "abc");
    }
}
