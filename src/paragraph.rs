//! Paragraph chunker for streamed answers.
//!
//! The agent streams answers back to the client one fragment at a time.
//! Fragments follow blank-line paragraph boundaries; oversized paragraphs
//! are packed line-by-line, and anything still larger than `max_size` is
//! hard-split into fixed-size pieces. Sizes are counted in characters so
//! multi-byte text never splits inside a code point.

/// Default fragment budget in characters.
pub const DEFAULT_PARAGRAPH_MAX_SIZE: usize = 300;

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Hard-split any chunk still above `max_size` into consecutive pieces of
/// exactly `max_size` characters (the last piece may be shorter).
fn split_long_chunks(chunks: Vec<String>, max_size: usize) -> Vec<String> {
    let mut output = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if char_len(&chunk) <= max_size {
            output.push(chunk);
            continue;
        }

        let chars: Vec<char> = chunk.chars().collect();
        for piece in chars.chunks(max_size) {
            output.push(piece.iter().collect());
        }
    }
    output
}

/// Split `text` into stream-sized fragments.
///
/// Paragraphs (split on `\n\n`, blanks dropped) at or under `max_size` pass
/// through unchanged. Larger paragraphs are rebuilt by greedily appending
/// lines while the running fragment stays within budget. Empty input yields
/// an empty list.
pub fn chunk_by_paragraph(text: &str, max_size: usize) -> Vec<String> {
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();

    if paragraphs.is_empty() {
        if text.is_empty() {
            return Vec::new();
        }
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();

    for paragraph in paragraphs {
        if char_len(paragraph) <= max_size {
            chunks.push(paragraph.to_string());
            continue;
        }

        let lines: Vec<&str> = paragraph.split('\n').filter(|line| !line.is_empty()).collect();
        if lines.is_empty() {
            chunks.push(paragraph.to_string());
            continue;
        }

        let mut current = String::new();
        for line in lines {
            if current.is_empty() {
                current = line.to_string();
                continue;
            }

            let candidate = format!("{current}\n{line}");
            if char_len(&candidate) > max_size {
                chunks.push(current);
                current = line.to_string();
            } else {
                current = candidate;
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }
    }

    split_long_chunks(chunks, max_size)
}
