//! Outbound message splitting.
//!
//! Transports cap message size (Telegram: 4096 chars); we split with a
//! budget below the cap, preferring paragraph boundaries, then line
//! boundaries, then hard character splits. Joining the chunks back with
//! their separators reproduces the input.

/// Split `text` into chunks of at most `limit` characters.
///
/// Preference order for split points: `"\n\n"`, `"\n"`, hard split. Each
/// returned chunk is non-empty; separators consumed at a boundary are not
/// carried into either neighbor.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let sep_cost = if current.is_empty() { 0 } else { 2 };
        if !current.is_empty() && current.len() + sep_cost + paragraph.len() > limit {
            chunks.push(std::mem::take(&mut current));
        }

        if paragraph.len() <= limit {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }

        // Paragraph alone exceeds the budget: fall back to line boundaries.
        flush_nonempty(&mut chunks, &mut current);
        for line in paragraph.split('\n') {
            let sep_cost = if current.is_empty() { 0 } else { 1 };
            if !current.is_empty() && current.len() + sep_cost + line.len() > limit {
                chunks.push(std::mem::take(&mut current));
            }

            if line.len() <= limit {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(line);
                continue;
            }

            // A single line longer than the budget: hard split on char
            // boundaries.
            flush_nonempty(&mut chunks, &mut current);
            let mut rest = line;
            while rest.len() > limit {
                let mut cut = limit;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        }
        flush_nonempty(&mut chunks, &mut current);
    }

    flush_nonempty(&mut chunks, &mut current);
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

fn flush_nonempty(chunks: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = split_message("Hello, world!", 3800);
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn exactly_at_limit_is_single_chunk() {
        let text = "a".repeat(3800);
        assert_eq!(split_message(&text, 3800).len(), 1);
    }

    #[test]
    fn nine_thousand_chars_split_into_three_paragraph_chunks() {
        // 9 paragraphs of ~1000 chars: 3 chunks, each at a "\n\n" boundary.
        let paragraph = "b".repeat(998);
        let text = vec![paragraph.clone(); 9].join("\n\n");
        assert_eq!(text.len(), 8_998); // 9×998 + 8×2

        let chunks = split_message(&text, 3800);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 3800, "chunk too large: {}", chunk.len());
        }
        // Concatenated content is identical to the input.
        assert_eq!(chunks.join("\n\n"), text);
    }

    #[test]
    fn falls_back_to_line_boundaries() {
        let line = "c".repeat(120);
        let paragraph = vec![line.clone(); 10].join("\n"); // 1209 chars, no "\n\n"
        let chunks = split_message(&paragraph, 500);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 500);
            assert!(chunk.starts_with('c'));
        }
        assert_eq!(chunks.join("\n"), paragraph);
    }

    #[test]
    fn hard_splits_a_single_long_line() {
        let text = "x".repeat(9000);
        let chunks = split_message(&text, 3800);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(String::len).sum::<usize>(), 9000);
        for chunk in &chunks {
            assert!(chunk.len() <= 3800);
        }
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "ü".repeat(3000); // 2 bytes each
        let chunks = split_message(&text, 1000);
        for chunk in &chunks {
            assert!(chunk.len() <= 1000);
            assert!(chunk.chars().all(|c| c == 'ü'));
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn mixed_paragraphs_and_long_lines() {
        let text = format!("intro\n\n{}\n\noutro", "y".repeat(5000));
        let chunks = split_message(&text, 3800);
        assert!(chunks.iter().all(|c| c.len() <= 3800));
        assert!(chunks.first().unwrap().starts_with("intro"));
        assert!(chunks.last().unwrap().ends_with("outro"));
    }
}
