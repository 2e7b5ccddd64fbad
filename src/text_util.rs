/// Words too common to say anything about a topic.
const STOPWORDS: &[&str] = &[
    "about", "after", "also", "and", "are", "but", "can", "could", "did",
    "does", "for", "from", "had", "has", "have", "how", "into", "its", "not",
    "please", "should", "tell", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "was", "were", "what", "when",
    "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

/// Split text into lowercase alphanumeric words.
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Words of at least three characters that are not stopwords.
pub fn keywords(text: &str) -> Vec<String> {
    words(text)
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Truncate to at most `max_chars` characters, appending "..." when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", text[..byte_idx].trim_end()),
        None => text.to_string(),
    }
}

/// Collapse runs of whitespace (including newlines) into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_lowercase_and_split_on_punctuation() {
        let w: Vec<_> = words("Hello, World! rust-lang 2024").collect();
        assert_eq!(w, vec!["hello", "world", "rust", "lang", "2024"]);
    }

    #[test]
    fn keywords_drop_stopwords_and_short_words() {
        let k = keywords("What is the refund policy for an order?");
        assert_eq!(k, vec!["refund", "policy", "order"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("café au lait", 4), "café...");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn collapse_whitespace_joins_lines() {
        assert_eq!(collapse_whitespace("a\n\n b\t c "), "a b c");
    }
}
