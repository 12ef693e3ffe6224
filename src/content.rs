use memchr::memmem;
use once_cell::sync::Lazy;
use regex::Regex;

/// Everything from this marker onwards is citation noise.
pub const REFERENCES_MARKER: &str = "==References==";

static MARKUP_TOKENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[|\]\]|==").unwrap());

static CATEGORY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[Category:([^|\]]+?)(?:\|[^\]]+)?\]\]").unwrap());

static IMAGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\[(?:File|Image):([^|\]]+?)(?:\|[^\]]*)*\]\]").unwrap());

static COMMENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static REF_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<ref[^>]*/>|<ref[^>]*>.*?</ref>").unwrap());

static HTML_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());

static MEDIA_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\[(?:File|Image|Category):[^\]]*\]\]").unwrap());

static MEDIA_LINE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*(?:File|Image|Category):.*$").unwrap());

static PIPED_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[(?:[^|\]]*\|)?([^\]]+)\]\]").unwrap());

static EXTERNAL_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[https?://[^\s\]]+(?:\s+([^\]]*))?\]").unwrap());

static EMPHASIS_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"'{2,5}").unwrap());

static HEADING_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*=+[ \t]*(.*?)[ \t]*=+[ \t]*$").unwrap());

static LIST_MARKER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[*#:;]+[ \t]*").unwrap());

static ENTITY_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"&(?:nbsp|#160);").unwrap());

pub fn extract_categories(text: &str) -> Vec<String> {
    CATEGORY_REGEX
        .captures_iter(text)
        .map(|c| sanitize_field(c[1].trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Image file names referenced by `[[File:..]]` / `[[Image:..]]`, first occurrence wins.
pub fn image_references(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in IMAGE_REGEX.captures_iter(text) {
        let name = sanitize_field(caps[1].trim());
        if !name.is_empty() && !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Collapses newlines into spaces so names stay on a single line.
fn sanitize_field(s: &str) -> String {
    if s.contains('\n') || s.contains('\r') {
        s.replace(['\n', '\r'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        s.to_string()
    }
}

/// Cuts the text at the references section, then drops `[[`, `]]` and `==`.
///
/// The cut happens first: stripping `==` would otherwise erase the marker itself.
pub fn normalize_text(text: &str) -> String {
    let kept = match memmem::find(text.as_bytes(), REFERENCES_MARKER.as_bytes()) {
        Some(pos) => &text[..pos],
        None => text,
    };
    MARKUP_TOKENS.replace_all(kept, "").into_owned()
}

/// Reduces wikitext to plain sentences, one paragraph per line.
pub fn clean_text(text: &str) -> String {
    let text = COMMENT_REGEX.replace_all(text, "");
    let text = REF_REGEX.replace_all(&text, "");
    let text = strip_nested(&text, "{{", "}}");
    let text = strip_nested(&text, "{|", "|}");
    let text = MEDIA_LINK_REGEX.replace_all(&text, "");
    let text = MEDIA_LINE_REGEX.replace_all(&text, "");
    let text = PIPED_LINK_REGEX.replace_all(&text, "$1");
    let text = EXTERNAL_LINK_REGEX.replace_all(&text, "$1");
    let text = HTML_TAG_REGEX.replace_all(&text, "");
    let text = EMPHASIS_REGEX.replace_all(&text, "");
    let text = HEADING_REGEX.replace_all(&text, "$1");
    let text = LIST_MARKER_REGEX.replace_all(&text, "");
    let text = ENTITY_REGEX.replace_all(&text, " ");

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removes balanced `open .. close` spans, including nested ones.
/// An unclosed span swallows the rest of the text.
fn strip_nested(text: &str, open: &str, close: &str) -> String {
    let open = open.as_bytes();
    let close = close.as_bytes();
    let bytes = text.as_bytes();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;
    let mut run_start = 0;

    while i < bytes.len() {
        if bytes[i..].starts_with(open) {
            if run_start < i {
                result.push_str(&text[run_start..i]);
            }
            let mut depth: i32 = 0;
            while i < bytes.len() {
                if bytes[i..].starts_with(open) {
                    depth += 1;
                    i += open.len();
                } else if bytes[i..].starts_with(close) {
                    depth -= 1;
                    i += close.len();
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            run_start = i;
        } else {
            i += 1;
        }
    }

    if run_start < bytes.len() {
        result.push_str(&text[run_start..]);
    }

    result
}
