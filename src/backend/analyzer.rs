//! Text analyzers used by the in-memory backend.
//!
//! Each analyzer turns a field value (or a query term) into the token stream
//! the backend indexes and searches with.

/// Tokens longer than this are dropped, like the backend's default limit
const MAX_TOKEN_LENGTH: usize = 255;

/// Stop words removed by the `english` analyzer
pub const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Named analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analyzer {
    /// Split on non-alphanumerics, lowercase
    Standard,
    /// Standard plus stop-word removal and light stemming
    English,
    /// Split on whitespace only, case preserved
    Whitespace,
    /// Whole value as one token
    Keyword,
    /// Whole value as one lowercased token
    Exact,
}

impl Analyzer {
    /// Look up an analyzer by name; unknown names behave like `standard`
    pub fn from_name(name: &str) -> Self {
        match name {
            "english" => Analyzer::English,
            "whitespace" => Analyzer::Whitespace,
            "keyword" => Analyzer::Keyword,
            "exact" => Analyzer::Exact,
            _ => Analyzer::Standard,
        }
    }

    pub fn analyze(self, text: &str) -> Vec<String> {
        match self {
            Analyzer::Standard => split_words(text),
            Analyzer::English => split_words(text)
                .into_iter()
                .filter(|t| !ENGLISH_STOP_WORDS.contains(&t.as_str()))
                .map(|t| stem(&t))
                .collect(),
            Analyzer::Whitespace => text
                .split_whitespace()
                .filter(|t| t.len() <= MAX_TOKEN_LENGTH)
                .map(str::to_string)
                .collect(),
            Analyzer::Keyword => vec![text.to_string()],
            Analyzer::Exact => vec![text.to_lowercase()],
        }
    }
}

/// Analyze `text` with the named analyzer
pub fn analyze(name: &str, text: &str) -> Vec<String> {
    Analyzer::from_name(name).analyze(text)
}

/// Is `ch` a token separator for the word-splitting analyzers?
pub fn is_separator(ch: char) -> bool {
    !ch.is_alphanumeric() && ch != '_'
}

fn split_words(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if is_separator(ch) {
            push_token(&mut tokens, &mut current);
        } else {
            current.extend(ch.to_lowercase());
        }
    }
    push_token(&mut tokens, &mut current);

    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() && current.len() <= MAX_TOKEN_LENGTH {
        tokens.push(std::mem::take(current));
    }
    current.clear();
}

/// Light plural stemmer
fn stem(token: &str) -> String {
    if token.len() > 4 {
        if let Some(base) = token.strip_suffix("ies") {
            return format!("{}y", base);
        }
    }
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") && !token.ends_with("us") {
        return token[..token.len() - 1].to_string();
    }
    token.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_splits_and_lowercases() {
        assert_eq!(analyze("standard", "C-Note rocks_hard"), vec!["c", "note", "rocks_hard"]);
        assert!(analyze("standard", " -- ").is_empty());
    }

    #[test]
    fn test_english_stop_words_and_stems() {
        assert_eq!(analyze("english", "The Stories of dogs"), vec!["story", "dog"]);
        assert!(analyze("english", "the and of").is_empty());
        assert_eq!(analyze("english", "glass bus"), vec!["glass", "bus"]);
    }

    #[test]
    fn test_verbatim_analyzers() {
        assert_eq!(analyze("keyword", "Foo Bar"), vec!["Foo Bar"]);
        assert_eq!(analyze("exact", "Foo Bar"), vec!["foo bar"]);
        assert_eq!(analyze("whitespace", "Foo  Bar"), vec!["Foo", "Bar"]);
    }
}
