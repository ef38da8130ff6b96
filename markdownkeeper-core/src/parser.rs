//! Markdown parser: turns raw file text into a [`ParsedDocument`].
//!
//! Pure function, no I/O. Frontmatter is parsed leniently — a malformed or
//! absent block simply yields an empty frontmatter map rather than an
//! error, so a bad file never blocks ingestion.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::models::{
    Frontmatter, FrontmatterValue, ParsedChunk, ParsedDocument, ParsedHeading, ParsedLink,
};

const MAX_CHUNK_WORDS: usize = 120;
const SUMMARY_MAX_TOKENS: usize = 150;
const TOP_CONCEPTS: usize = 10;
const HEADING_WEIGHT: usize = 2;

/// Parse raw Markdown text into its structured form.
pub fn parse(text: &str) -> ParsedDocument {
    let (frontmatter, body) = split_frontmatter(text);
    let (headings, chunks) = walk_body(body);
    let links = extract_links(body);

    let title = derive_title(&frontmatter, &headings);
    let category = frontmatter
        .get("category")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let tags = frontmatter
        .get("tags")
        .map(|v| v.clone().into_list())
        .unwrap_or_default();
    let concepts = derive_concepts(&frontmatter, body, &headings);
    let summary = derive_summary(&frontmatter, &title, &headings, body);
    let token_estimate = count_tokens(body) as i64;
    let content_hash = hex_sha256(text.as_bytes());

    ParsedDocument {
        frontmatter,
        headings,
        links,
        chunks,
        title,
        summary,
        category,
        tags,
        concepts,
        token_estimate,
        content_hash,
    }
}

/// Split off a leading `---`-delimited frontmatter block, if present.
///
/// Returns `(frontmatter, body)`. An unterminated or unparsable block
/// yields an empty map and leaves the whole input as `body`.
fn split_frontmatter(text: &str) -> (Frontmatter, &str) {
    let mut lines = text.lines();
    let Some(first) = lines.next() else {
        return (Frontmatter::new(), text);
    };
    if first.trim() != "---" {
        return (Frontmatter::new(), text);
    }

    let mut consumed = first.len() + 1;
    let mut yaml_lines = Vec::new();
    let mut closed = false;
    for line in lines {
        consumed += line.len() + 1;
        if line.trim() == "---" {
            closed = true;
            break;
        }
        yaml_lines.push(line);
    }

    if !closed {
        return (Frontmatter::new(), text);
    }

    let body = text.get(consumed.min(text.len())..).unwrap_or("");
    let frontmatter = parse_frontmatter_block(&yaml_lines.join("\n"));
    (frontmatter, body)
}

/// Best-effort `key: value` frontmatter parser. Understands scalars, quoted
/// strings, and bracketed `[a, b, c]` lists. Anything it cannot parse is
/// simply omitted rather than erroring.
fn parse_frontmatter_block(block: &str) -> Frontmatter {
    let mut map = HashMap::new();
    for raw_line in block.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches(|c| c == '"' || c == '\'');
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        map.insert(key.to_string(), parse_scalar_or_list(value));
    }
    map
}

fn parse_scalar_or_list(value: &str) -> FrontmatterValue {
    if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let items = inner
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|item| !item.is_empty())
            .collect();
        return FrontmatterValue::List(items);
    }

    let unquoted = value.trim_matches(|c| c == '"' || c == '\'');

    if unquoted.eq_ignore_ascii_case("true") {
        return FrontmatterValue::Bool(true);
    }
    if unquoted.eq_ignore_ascii_case("false") {
        return FrontmatterValue::Bool(false);
    }
    if let Ok(n) = unquoted.parse::<i64>() {
        return FrontmatterValue::Int(n);
    }

    FrontmatterValue::String(unquoted.to_string())
}

/// Walk the body recording headings and emitting chunks in a single pass,
/// so each chunk can be attached to the heading path active when it began.
fn walk_body(body: &str) -> (Vec<ParsedHeading>, Vec<ParsedChunk>) {
    let mut headings = Vec::new();
    let mut chunks = Vec::new();
    let mut stack: [Option<String>; 6] = Default::default();
    let mut heading_ordinal: i64 = 0;
    let mut chunk_ordinal: i64 = 0;
    let mut paragraph_lines: Vec<&str> = Vec::new();

    for line in body.lines() {
        if let Some((level, text)) = parse_atx_heading(line) {
            flush_paragraph(&mut paragraph_lines, &stack, &mut chunks, &mut chunk_ordinal);
            let idx = (level - 1) as usize;
            stack[idx] = Some(text.clone());
            for slot in stack.iter_mut().skip(idx + 1) {
                *slot = None;
            }
            headings.push(ParsedHeading {
                ordinal: heading_ordinal,
                level,
                text: text.clone(),
                anchor: slugify(&text),
            });
            heading_ordinal += 1;
        } else if line.trim().is_empty() {
            flush_paragraph(&mut paragraph_lines, &stack, &mut chunks, &mut chunk_ordinal);
        } else {
            paragraph_lines.push(line);
        }
    }
    flush_paragraph(&mut paragraph_lines, &stack, &mut chunks, &mut chunk_ordinal);

    (headings, chunks)
}

fn flush_paragraph(
    lines: &mut Vec<&str>,
    stack: &[Option<String>; 6],
    chunks: &mut Vec<ParsedChunk>,
    chunk_ordinal: &mut i64,
) {
    if lines.is_empty() {
        return;
    }
    let paragraph = lines.join("\n");
    lines.clear();
    let heading_path = stack.iter().flatten().cloned().collect::<Vec<_>>().join("/");
    for piece in split_paragraph_by_words(&paragraph, MAX_CHUNK_WORDS) {
        if piece.trim().is_empty() {
            continue;
        }
        chunks.push(ParsedChunk {
            ordinal: *chunk_ordinal,
            heading_path: heading_path.clone(),
            token_estimate: count_tokens(&piece) as i64,
            content: piece,
        });
        *chunk_ordinal += 1;
    }
}

fn parse_atx_heading(line: &str) -> Option<(u8, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some((hashes as u8, rest.trim().to_string()))
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Split a paragraph into pieces of at most `max_words` whitespace-
/// separated words, preserving the original whitespace within each piece.
fn split_paragraph_by_words(paragraph: &str, max_words: usize) -> Vec<String> {
    let spans = word_spans(paragraph);
    if spans.is_empty() {
        return Vec::new();
    }
    let mut pieces = Vec::new();
    let mut group_start = spans[0].0;
    let mut count = 0;
    for (i, &(_start, end)) in spans.iter().enumerate() {
        count += 1;
        let is_last_word = i + 1 == spans.len();
        if count == max_words || is_last_word {
            pieces.push(paragraph[group_start..end].to_string());
            if !is_last_word {
                group_start = spans[i + 1].0;
            }
            count = 0;
        }
    }
    pieces
}

fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

fn extract_links(body: &str) -> Vec<ParsedLink> {
    let mut links = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => {
                if let Some((target, next)) = parse_inline_link(body, i) {
                    links.push(ParsedLink {
                        is_external: is_external_target(&target),
                        target,
                    });
                    i = next;
                    continue;
                }
            }
            b'<' => {
                if let Some((target, next)) = parse_autolink(body, i) {
                    links.push(ParsedLink {
                        is_external: is_external_target(&target),
                        target,
                    });
                    i = next;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    links
}

fn parse_inline_link(body: &str, start: usize) -> Option<(String, usize)> {
    let rest = &body[start..];
    let close_text = rest.find(']')?;
    if rest.as_bytes().get(close_text + 1) != Some(&b'(') {
        return None;
    }
    let paren_start = close_text + 2;
    let close_paren = rest[paren_start..].find(')')?;
    let target = rest[paren_start..paren_start + close_paren].trim();
    let target = target.split_whitespace().next().unwrap_or("").to_string();
    if target.is_empty() {
        return None;
    }
    Some((target, start + paren_start + close_paren + 1))
}

fn parse_autolink(body: &str, start: usize) -> Option<(String, usize)> {
    let rest = &body[start + 1..];
    let close = rest.find('>')?;
    let candidate = &rest[..close];
    if candidate.contains(char::is_whitespace) || !looks_like_scheme(candidate) {
        return None;
    }
    Some((candidate.to_string(), start + 1 + close + 1))
}

fn looks_like_scheme(candidate: &str) -> bool {
    match candidate.find("://") {
        Some(idx) => is_valid_scheme(&candidate[..idx]),
        None => false,
    }
}

fn is_external_target(target: &str) -> bool {
    match target.find("://") {
        Some(idx) => is_valid_scheme(&target[..idx]),
        None => false,
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
}

fn derive_title(frontmatter: &Frontmatter, headings: &[ParsedHeading]) -> String {
    if let Some(title) = frontmatter.get("title").and_then(|v| v.as_str()) {
        return title.to_string();
    }
    if let Some(first) = headings.first() {
        return first.text.clone();
    }
    "Untitled".to_string()
}

fn derive_summary(
    frontmatter: &Frontmatter,
    title: &str,
    headings: &[ParsedHeading],
    body: &str,
) -> String {
    if let Some(summary) = frontmatter.get("summary").and_then(|v| v.as_str()) {
        return truncate_tokens(summary, SUMMARY_MAX_TOKENS);
    }

    let h2_list = headings
        .iter()
        .filter(|h| h.level == 2)
        .map(|h| h.text.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let first_paragraph = body
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && parse_atx_heading(p).is_none());

    let auto = match (h2_list.is_empty(), first_paragraph) {
        (false, Some(p)) => format!("{title}. Covers: {h2_list}. {p}"),
        (false, None) => format!("{title}. Covers: {h2_list}."),
        (true, Some(p)) => format!("{title}. {p}"),
        (true, None) => format!("{title}."),
    };

    truncate_tokens(&auto, SUMMARY_MAX_TOKENS)
}

fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_tokens {
        text.trim().to_string()
    } else {
        words[..max_tokens].join(" ")
    }
}

fn derive_concepts(
    frontmatter: &Frontmatter,
    body: &str,
    headings: &[ParsedHeading],
) -> Vec<String> {
    if let Some(concepts) = frontmatter.get("concepts") {
        return concepts
            .clone()
            .into_list()
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
    }

    let heading_text: String = headings
        .iter()
        .map(|h| h.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let heading_tokens: std::collections::HashSet<String> =
        tokenize_concepts(&heading_text).into_iter().collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (i, token) in tokenize_concepts(body).into_iter().enumerate() {
        let weight = if heading_tokens.contains(&token) {
            HEADING_WEIGHT
        } else {
            1
        };
        *counts.entry(token.clone()).or_insert(0) += weight;
        first_seen.entry(token).or_insert(i);
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(term, count)| {
            let seen = *first_seen.get(&term).unwrap_or(&usize::MAX);
            (term, count, seen)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(TOP_CONCEPTS)
        .map(|(term, _, _)| term)
        .collect()
}

fn tokenize_concepts(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_alphabetic() {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if word.len() >= 3 {
                let lower = word.to_lowercase();
                if !is_stopword(&lower) {
                    tokens.push(lower);
                }
            }
        } else {
            i += 1;
        }
    }
    tokens
}

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
    "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see", "two",
    "way", "who", "boy", "did", "its", "let", "put", "say", "she", "too", "use", "with", "this",
    "that", "from", "have", "will", "your", "they", "been", "were", "into", "than", "them",
    "then", "when", "what", "which", "their", "there", "these", "those", "would", "could",
    "should", "about", "after", "before", "between", "through", "during", "while", "where",
    "because", "each", "some", "such", "only", "also", "both", "more", "most", "other", "over",
    "under", "again", "further", "once", "here", "very", "just", "being", "does", "doing",
    "itself", "himself", "herself", "themselves", "having", "same",
];

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_matches_raw_input() {
        let text = "# Title\nbody text";
        let parsed = parse(text);
        assert_eq!(parsed.content_hash, hex_sha256(text.as_bytes()));
    }

    #[test]
    fn reparsing_is_deterministic() {
        let text =
            "---\ntitle: Hello\ntags: a, b\n---\n# Hello\n\nSome body text about kubernetes.";
        assert_eq!(parse(text), parse(text));
    }

    #[test]
    fn frontmatter_title_and_tags() {
        let text = "---\ntitle: My Doc\ntags: [rust, cli]\n---\n# Heading\n\nBody.";
        let parsed = parse(text);
        assert_eq!(parsed.title, "My Doc");
        assert_eq!(parsed.tags, vec!["rust", "cli"]);
    }

    #[test]
    fn missing_frontmatter_falls_back_to_first_heading() {
        let parsed = parse("# Alpha\n\nkubernetes deployment guide");
        assert_eq!(parsed.title, "Alpha");
    }

    #[test]
    fn untitled_when_no_heading_or_frontmatter() {
        let parsed = parse("just some text, no heading");
        assert_eq!(parsed.title, "Untitled");
    }

    #[test]
    fn malformed_frontmatter_is_lenient() {
        let parsed = parse("---\nthis is not : valid: yaml: at all\n---\n# Still Parses");
        assert_eq!(parsed.title, "Still Parses");
    }

    #[test]
    fn headings_get_slug_anchors() {
        let parsed = parse("## Hello, World! Example");
        assert_eq!(parsed.headings[0].anchor, "hello-world-example");
    }

    #[test]
    fn heading_path_tracks_nesting() {
        let parsed = parse(
            "# Installation\n\n## Prerequisites\n\nNeed rust installed.\n\n## Steps\n\nRun cargo build.",
        );
        let steps_chunk = parsed
            .chunks
            .iter()
            .find(|c| c.content.contains("cargo build"))
            .unwrap();
        assert_eq!(steps_chunk.heading_path, "Installation/Steps");
    }

    #[test]
    fn chunk_splits_long_paragraph_at_120_words() {
        let long_paragraph = (0..200)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let parsed = parse(&long_paragraph);
        assert!(parsed.chunks.len() >= 2);
        assert!(parsed.chunks[0].content.split_whitespace().count() <= MAX_CHUNK_WORDS);
    }

    #[test]
    fn extracts_inline_and_autolink_links() {
        let parsed = parse(
            "See [docs](https://example.com/docs) and <https://example.org>, also [local](./nope.md).",
        );
        assert_eq!(parsed.links.len(), 3);
        assert!(parsed.links[0].is_external);
        assert!(parsed.links[1].is_external);
        assert!(!parsed.links[2].is_external);
    }

    #[test]
    fn top_concept_is_highest_weighted_count() {
        let parsed = parse(
            "# Kubernetes\n\nkubernetes kubernetes deployment deployment deployment networking",
        );
        // "kubernetes" appears 3 times (weight 2, from the heading) = 6;
        // "deployment" appears 3 times (weight 1) = 3.
        assert_eq!(parsed.concepts[0], "kubernetes");
    }

    #[test]
    fn concepts_weight_heading_words_over_raw_frequency() {
        let parsed = parse("# Kubernetes\n\nkubernetes deployment deployment deployment");
        // Raw occurrences: kubernetes x2 (once in the heading, once in the body),
        // deployment x3. Without the heading weight deployment would win on raw
        // count (3 > 2); the heading weight (2x) lifts kubernetes to 4, ahead of
        // deployment's 3.
        assert_eq!(parsed.concepts[0], "kubernetes");
    }

    #[test]
    fn token_estimate_counts_whitespace_tokens() {
        let parsed = parse("one two three four");
        assert_eq!(parsed.token_estimate, 4);
    }
}
