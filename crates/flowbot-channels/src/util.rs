/// Split a message into chunks of at most `max_len` bytes.
///
/// Splits on newline boundaries when possible, falling back to hard splits
/// (on a char boundary) when a single line exceeds the limit.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(4);
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let needed = if current.is_empty() {
            line.len()
        } else {
            current.len() + 1 + line.len()
        };

        if needed <= max_len {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        let mut remaining = line;
        while remaining.len() > max_len {
            let mut cut = max_len;
            while !remaining.is_char_boundary(cut) {
                cut -= 1;
            }
            chunks.push(remaining[..cut].to_string());
            remaining = &remaining[cut..];
        }
        current = remaining.to_string();
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_unchanged() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
        assert_eq!(split_message("", 100), vec![""]);
    }

    #[test]
    fn split_on_newlines() {
        let text = "line1\nline2\nline3";
        assert_eq!(split_message(text, 11), vec!["line1\nline2", "line3"]);
    }

    #[test]
    fn hard_split_long_line() {
        let text = "a".repeat(25);
        let result = split_message(&text, 10);
        assert_eq!(result.len(), 3);
        assert_eq!(result[2].len(), 5);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(10); // 2 bytes each
        let result = split_message(&text, 5);
        assert!(result.iter().all(|c| c.len() <= 5));
        assert_eq!(result.concat(), text);
    }
}
