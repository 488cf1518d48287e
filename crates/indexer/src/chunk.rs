//! Text chunking for embedding.

/// Splits extracted text into chunks bounded by a character budget.
///
/// Paragraphs (blank-line separated) are packed greedily: each chunk takes
/// whole paragraphs until the next one would overflow. A single paragraph
/// larger than the budget is split at character boundaries.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_chars: usize,
}

impl Chunker {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0;

        for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let para_chars = paragraph.chars().count();

            if para_chars > self.max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_chars = 0;
                }
                chunks.extend(hard_split(paragraph, self.max_chars));
                continue;
            }

            let separator = if current.is_empty() { 0 } else { 2 };
            if current_chars + separator + para_chars > self.max_chars {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }

            if !current.is_empty() {
                current.push_str("\n\n");
                current_chars += 2;
            }
            current.push_str(paragraph);
            current_chars += para_chars;
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

/// Split one oversized paragraph into `max_chars`-sized pieces, counting
/// characters so multibyte text never splits mid-codepoint.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in paragraph.chars() {
        current.push(ch);
        count += 1;
        if count == max_chars {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
    }

    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = Chunker::new(100).split("one paragraph");
        assert_eq!(chunks, vec!["one paragraph".to_string()]);
    }

    #[test]
    fn test_packs_paragraphs_up_to_budget() {
        // each paragraph is 10 chars; budget fits two plus a separator
        let text = "aaaaaaaaaa\n\nbbbbbbbbbb\n\ncccccccccc";
        let chunks = Chunker::new(22).split(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "aaaaaaaaaa\n\nbbbbbbbbbb");
        assert_eq!(chunks[1], "cccccccccc");
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let text = "x".repeat(25);
        let chunks = Chunker::new(10).split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_hard_split_respects_char_boundaries() {
        // 3-byte codepoints; a byte-based split would panic or corrupt
        let text = "日本語のテキスト".repeat(4);
        let chunks = Chunker::new(5).split(&text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_every_chunk_within_budget() {
        let text = "alpha beta gamma\n\ndelta epsilon\n\n".repeat(20);
        let max = 40;
        for chunk in Chunker::new(max).split(&text) {
            assert!(chunk.chars().count() <= max, "chunk over budget: {chunk:?}");
        }
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(Chunker::new(100).split("").is_empty());
        assert!(Chunker::new(100).split("  \n\n   \n\n ").is_empty());
    }
}
