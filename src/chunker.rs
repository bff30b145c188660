//! Sentence-boundary text chunker.
//!
//! Splits extracted document text into overlapping, bounded-size segments.
//! Sentences are detected with a lightweight heuristic (break after `.`, `!`,
//! or `?` followed by whitespace and an uppercase letter), then greedily
//! packed into chunks of at most `chunk_size` characters. Each new chunk is
//! seeded with the tail of the previous one so context straddling a boundary
//! is retrievable from either side.
//!
//! The size bound is soft: a single sentence longer than `chunk_size` is
//! emitted whole rather than split mid-sentence.

/// One chunk of text with its zero-based position in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub content: String,
    pub index: i64,
}

/// Split `text` into chunks of at most `chunk_size` characters with
/// `overlap` characters carried between consecutive chunks.
///
/// Indices are dense, zero-based, in document order. Empty input produces no
/// chunks.
pub fn split(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let sentences = split_sentences(text);

    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut index: i64 = 0;

    for sentence in sentences {
        if !buf.is_empty() && buf.len() + 1 + sentence.len() > chunk_size {
            let tail = overlap_tail(&buf, overlap);
            chunks.push(TextChunk {
                content: buf.trim().to_string(),
                index,
            });
            index += 1;

            buf = if tail.is_empty() {
                sentence.to_string()
            } else {
                format!("{} {}", tail, sentence)
            };
        } else {
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(sentence);
        }
    }

    if !buf.trim().is_empty() {
        chunks.push(TextChunk {
            content: buf.trim().to_string(),
            index,
        });
    }

    chunks
}

/// Split text into sentence-like segments.
///
/// A boundary is a `.`, `!`, or `?` followed by one or more whitespace
/// characters and an uppercase letter. This is a heuristic, not a tokenizer:
/// abbreviations before capitalized words ("Dr. Smith") over-split, and it
/// never splits inside a sentence, so a single long sentence stays one
/// segment.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;

    for (i, c) in text.char_indices() {
        if i < start || !matches!(c, '.' | '!' | '?') {
            continue;
        }

        let rest = &text[i + c.len_utf8()..];
        let ws_len: usize = rest
            .chars()
            .take_while(|ch| ch.is_whitespace())
            .map(|ch| ch.len_utf8())
            .sum();
        if ws_len == 0 {
            continue;
        }
        if rest[ws_len..].chars().next().is_some_and(|u| u.is_uppercase()) {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end + ws_len;
        }
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// The seed carried from a closed chunk into the next one: the last
/// `overlap` characters, shrunk from the left to the nearest word start so a
/// word is never split. A tail that is one partial word is dropped entirely.
fn overlap_tail(buf: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }

    let trimmed = buf.trim();
    if trimmed.chars().count() <= overlap {
        return trimmed.to_string();
    }

    let start = trimmed
        .char_indices()
        .rev()
        .nth(overlap - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &trimmed[start..];

    let starts_on_boundary = trimmed[..start].ends_with(char::is_whitespace)
        || tail.starts_with(char::is_whitespace);
    if starts_on_boundary {
        tail.trim_start().to_string()
    } else {
        match tail.find(char::is_whitespace) {
            Some(pos) => tail[pos..].trim_start().to_string(),
            None => String::new(),
        }
    }
}
