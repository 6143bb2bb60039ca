//! Outbound message chunking.
//!
//! Long responses are split at the platform limit, preferring paragraph
//! boundaries, then sentence ends, then word breaks, then raw characters.
//! Concatenating the chunks reproduces the original text exactly, so inline
//! formatting survives the split.

/// Split `text` into chunks of at most `limit` bytes.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 {
        return vec![text.to_string()];
    }
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for piece in atoms(text, limit) {
        if !current.is_empty() && current.len() + piece.len() > limit {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Break the text into indivisible pieces, each at most `limit` bytes,
/// descending the boundary ladder only where a piece is still too large.
fn atoms(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    for paragraph in split_after(text, "\n\n") {
        if paragraph.len() <= limit {
            out.push(paragraph);
            continue;
        }
        for sentence in split_sentences(&paragraph) {
            if sentence.len() <= limit {
                out.push(sentence);
                continue;
            }
            for word in split_words(&sentence) {
                if word.len() <= limit {
                    out.push(word);
                } else {
                    out.extend(split_chars(&word, limit));
                }
            }
        }
    }
    out
}

/// Split keeping each separator attached to the piece before it, so the
/// concatenation of pieces equals the input.
fn split_after(text: &str, sep: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find(sep) {
        let cut = idx + sep.len();
        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Cut after sentence-ending punctuation followed by whitespace (the
/// whitespace stays with the finished sentence), or after a newline.
fn split_sentences(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        let cut = match ch {
            '\n' => Some(idx + ch.len_utf8()),
            // Include the single whitespace char after the punctuation.
            '.' | '!' | '?' => match chars.peek().copied() {
                Some((next_idx, next_ch)) if next_ch.is_whitespace() => {
                    Some(next_idx + next_ch.len_utf8())
                }
                _ => None,
            },
            _ => None,
        };
        if let Some(cut) = cut {
            if ch != '\n' {
                chars.next();
            }
            pieces.push(text[start..cut].to_string());
            start = cut;
        }
    }
    if start < text.len() {
        pieces.push(text[start..].to_string());
    }
    pieces
}

fn split_words(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(ToString::to_string)
        .collect()
}

fn split_chars(text: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > limit && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_lossless(text: &str, limit: usize) {
        let chunks = chunk_message(text, limit);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.len() <= limit, "chunk over limit: {}", chunk.len());
        }
    }

    #[test]
    fn short_message_is_single_chunk() {
        assert_eq!(chunk_message("hello", 4096), vec!["hello".to_string()]);
    }

    #[test]
    fn splits_on_paragraph_boundary_first() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_message(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[0].ends_with("\n\n"));
        assert!(chunks[1].starts_with('b'));
        assert_lossless(&text, 80);
    }

    #[test]
    fn falls_back_to_sentences_inside_long_paragraph() {
        let text = format!("{}. {}. tail", "x".repeat(50), "y".repeat(50));
        let chunks = chunk_message(&text, 60);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].ends_with(". "));
        assert_lossless(&text, 60);
    }

    #[test]
    fn falls_back_to_words_then_chars() {
        let text = format!("{} {}", "word ".repeat(30), "z".repeat(200));
        assert_lossless(&text, 64);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ".repeat(100);
        assert_lossless(&text, 50);
    }

    #[test]
    fn preserves_inline_formatting_markers() {
        let text = format!("*bold start* {}\n\n_italic tail_", "filler ".repeat(40));
        let chunks = chunk_message(&text, 120);
        assert_eq!(chunks.concat(), text);
    }
}
