//! Paragraph-boundary text splitter.
//!
//! Splits reference-document text into pieces that respect a configurable
//! `max_chars` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence within each piece; chunk identity (the
//! content hash) is assigned later by [`crate::models::Chunk::new`].

/// Split text into pieces on paragraph boundaries, respecting max_chars.
/// Never returns an empty vector for non-empty input.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in paragraphs {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Flush the buffer before this paragraph would push it past the limit
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // separator included
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        // If a single paragraph exceeds max, hard-split it
        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                pieces.push(std::mem::take(&mut current_buf));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                // Prefer a newline or space boundary when one exists
                let mut actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                // Always consume at least one char so the loop terminates
                if actual_split == 0 {
                    actual_split = remaining
                        .chars()
                        .next()
                        .map(|c| c.len_utf8())
                        .unwrap_or(remaining.len());
                }
                pieces.push(remaining[..actual_split].trim().to_string());
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Largest index <= `at` that lands on a UTF-8 char boundary.
pub fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut idx = at.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_piece() {
        let pieces = split_text("Hello, world!", 2000);
        assert_eq!(pieces, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_text("", 2000).is_empty());
        assert!(split_text("  \n\n  ", 2000).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let pieces = split_text(text, 2000);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].contains("First paragraph."));
        assert!(pieces[0].contains("Third paragraph."));
    }

    #[test]
    fn test_multiple_paragraphs_exceed_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let pieces = split_text(text, 30);
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(p.len() <= 30, "piece too long: {}", p.len());
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let text = "word ".repeat(100);
        let pieces = split_text(&text, 40);
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(p.len() <= 40);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(split_text(text, 12), split_text(text, 12));
    }

    #[test]
    fn test_floor_char_boundary_multibyte() {
        let s = "héllo";
        // Index 2 falls inside the two-byte 'é'
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, s.len()), s.len());
        assert_eq!(floor_char_boundary(s, 100), s.len());
    }
}
