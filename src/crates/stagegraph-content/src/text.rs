//! Text helpers shared by the content stages

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::fields::{Requirements, Source};

/// Papers up to this many pages may overshoot the target by [`SHORT_PAPER_OVERSHOOT`]
pub const SHORT_PAPER_PAGES: u32 = 4;

/// Overshoot allowed for short papers
pub const SHORT_PAPER_OVERSHOOT: f64 = 0.40;

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\([A-Z][A-Za-z'\-]+(?:\s+(?:&\s+[A-Z][A-Za-z'\-]+|et al\.))?,?\s*\d{4}\)")
            .unwrap_or_else(|e| unreachable!("citation pattern is valid: {}", e))
    })
}

fn reference_heading() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*#*\s*(references?|bibliography|works cited)\s*:?\s*$")
            .unwrap_or_else(|e| unreachable!("reference heading pattern is valid: {}", e))
    })
}

fn code_fence() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"```(?:json)?\s*")
            .unwrap_or_else(|e| unreachable!("fence pattern is valid: {}", e))
    })
}

/// Words in `text`, not counting in-text citations like "(Smith, 2020)"
pub fn count_words(text: &str) -> usize {
    citation_pattern()
        .replace_all(text, "")
        .split_whitespace()
        .count()
}

/// In-text citations in `text`
pub fn count_citations(text: &str) -> usize {
    citation_pattern().find_iter(text).count()
}

/// Word limit for a paper: short papers may overshoot more
pub fn max_words(target: usize, pages: u32, overshoot_ratio: f64) -> usize {
    let ratio = if pages <= SHORT_PAPER_PAGES {
        SHORT_PAPER_OVERSHOOT
    } else {
        overshoot_ratio
    };
    (target as f64 * (1.0 + ratio)).round() as usize
}

/// JSON object embedded in a generator reply
///
/// Markdown code fences are ignored; if the reply is not JSON as a whole, the
/// span from the first `{` to the last `}` is tried.
pub fn extract_json(reply: &str) -> Option<Value> {
    let cleaned = code_fence().replace_all(reply, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    let parsed = serde_json::from_str::<Value>(cleaned).ok().or_else(|| {
        let start = cleaned.find('{')?;
        let end = cleaned.rfind('}')?;
        (start < end)
            .then(|| serde_json::from_str::<Value>(&cleaned[start..=end]).ok())
            .flatten()
    })?;

    match parsed {
        Value::Object(ref map) if !map.is_empty() => Some(parsed),
        _ => None,
    }
}

/// Drop a trailing references section the generator added on its own
pub fn strip_reference_section(text: &str) -> String {
    let mut kept = Vec::new();
    for line in text.lines() {
        if reference_heading().is_match(line) {
            break;
        }
        kept.push(line);
    }
    kept.join("\n").trim().to_string()
}

/// A document split for humanization
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentParts {
    pub title: Option<String>,
    pub body: String,
    pub references: Option<String>,
}

impl DocumentParts {
    /// Put the parts back together around a (possibly rewritten) body
    pub fn reassemble(&self, body: &str) -> String {
        let mut parts = Vec::new();
        if let Some(title) = &self.title {
            parts.push(title.clone());
            parts.push(String::new());
        }
        parts.push(body.trim().to_string());
        if let Some(references) = &self.references {
            parts.push(String::new());
            parts.push(references.clone());
        }
        parts.join("\n")
    }
}

/// Split `text` into title, body and references
///
/// The title is the first non-empty line when it is a markdown heading or
/// shorter than 15 words. References start at a "References" heading.
pub fn split_document(text: &str) -> DocumentParts {
    let lines: Vec<&str> = text.lines().collect();
    let mut start = 0;
    let mut title = None;

    if let Some((index, line)) = lines.iter().enumerate().find(|(_, l)| !l.trim().is_empty()) {
        let trimmed = line.trim();
        let is_body_line = reference_heading().is_match(trimmed);
        if !is_body_line && (trimmed.starts_with('#') || trimmed.split_whitespace().count() < 15) {
            title = Some(line.to_string());
            start = index + 1;
        }
    }

    let end = lines[start..]
        .iter()
        .position(|l| reference_heading().is_match(l))
        .map(|p| start + p)
        .unwrap_or(lines.len());

    let references = (end < lines.len()).then(|| lines[end..].join("\n").trim().to_string());
    let body = lines[start..end].join("\n").trim().to_string();
    if body.is_empty() && title.is_some() {
        // a lone short line is body, not title
        return DocumentParts {
            title: None,
            body: lines[..end].join("\n").trim().to_string(),
            references,
        };
    }
    DocumentParts {
        title,
        body,
        references,
    }
}

/// One APA reference line for `source`
pub fn format_apa_reference(source: &Source) -> String {
    let authors = source.authors.trim();
    let author_part = if authors.is_empty() {
        "Unknown".to_string()
    } else if authors.contains(" et al.") || authors.contains(" & ") || authors.contains(',') {
        authors.to_string()
    } else {
        let parts: Vec<&str> = authors.split_whitespace().collect();
        match parts.split_last() {
            Some((last, given)) if !given.is_empty() => {
                let initials: Vec<String> = given
                    .iter()
                    .filter_map(|p| p.chars().next())
                    .map(|c| format!("{}.", c))
                    .collect();
                format!("{}, {}", last, initials.join(" "))
            }
            _ => authors.to_string(),
        }
    };

    let year = source
        .year
        .map(|y| y.to_string())
        .unwrap_or_else(|| "n.d.".to_string());
    let title = if source.title.trim().is_empty() {
        "Untitled"
    } else {
        source.title.trim().trim_end_matches('.')
    };

    let mut reference = format!("{} ({}). {}.", author_part, year, title);
    if !source.url.is_empty() {
        reference.push_str(&format!(" Retrieved from {}", source.url));
    }
    reference
}

/// References section for `sources`, sorted by author; empty without sources
pub fn references_section(sources: &[Source]) -> String {
    if sources.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&Source> = sources.iter().collect();
    sorted.sort_by(|a, b| a.authors.cmp(&b.authors));

    let mut lines = vec!["References".to_string(), String::new()];
    lines.extend(sorted.into_iter().map(format_apa_reference));
    lines.join("\n")
}

/// Focused search queries for the requirements
///
/// Keywords longer than three words are cut into overlapping three-word
/// queries; the topic is appended as a fallback.
pub fn search_queries(requirements: &Requirements) -> Vec<String> {
    let mut keywords = requirements
        .search_keywords
        .iter()
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    if keywords.trim().is_empty() {
        keywords = requirements.topic.clone();
    }
    let keywords = truncate_chars(&keywords, 100);

    let words: Vec<&str> = keywords.split_whitespace().collect();
    let mut queries = Vec::new();
    if words.len() > 3 {
        for chunk_start in (0..words.len()).step_by(2) {
            let end = (chunk_start + 3).min(words.len());
            let query = words[chunk_start..end].join(" ");
            if query.len() > 5 {
                queries.push(query);
            }
        }
    } else if !keywords.trim().is_empty() {
        queries.push(keywords.trim().to_string());
    }

    let topic = requirements.topic.trim();
    if !topic.is_empty() && !queries.iter().any(|q| q == topic) {
        queries.push(topic.to_string());
    }
    queries
}

/// At most `max` characters of `text`, cut on a character boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}
