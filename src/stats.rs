//! Text statistics recorded on each version.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TextStats {
    pub word_count: usize,
    pub char_count: usize,
    pub line_count: usize,
}

/// Compute word/char/line counts for a content snapshot.
pub fn text_stats(content: &str) -> TextStats {
    TextStats {
        word_count: content.split_whitespace().count(),
        char_count: content.chars().count(),
        line_count: if content.is_empty() {
            0
        } else {
            content.lines().count()
        },
    }
}
