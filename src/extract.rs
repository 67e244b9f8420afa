//! Plain-text extraction from PDF and HTML bytes.
//!
//! Loaders hand raw bytes here and get UTF-8 text back. Extraction never
//! panics on malformed input; it returns a `Processing` error instead.

use ragline_core::error::{RagError, Result};

/// Elements whose content is dropped entirely.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "nav", "header", "footer"];

/// Elements that start a new line of text.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "table",
    "section", "article", "main", "blockquote", "pre", "hr", "title",
];

pub fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::processing(format!("PDF extraction failed: {e}")))
}

/// Visible text of an HTML page, one block per line.
pub fn html_to_text(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len() / 2);
    let mut i = 0;

    while i < html.len() {
        let rest = &html[i..];
        if !rest.starts_with('<') {
            let next = rest.find('<').unwrap_or(rest.len());
            out.push_str(&rest[..next]);
            i += next;
            continue;
        }

        let Some(close) = rest.find('>') else {
            break;
        };
        let tag = &lower[i + 1..i + close];
        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");

        if !closing && SKIPPED_ELEMENTS.contains(&name) {
            let end_tag = format!("</{name}");
            let Some(pos) = lower[i + close..].find(&end_tag) else {
                break;
            };
            let end_start = i + close + pos;
            i = match lower[end_start..].find('>') {
                Some(p) => end_start + p + 1,
                None => html.len(),
            };
            continue;
        }

        if BLOCK_ELEMENTS.contains(&name) {
            out.push('\n');
        } else {
            out.push(' ');
        }
        i += close + 1;
    }

    normalize_lines(&decode_entities(&out))
}

/// Contents of the first `<title>` element.
pub fn html_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = normalize_lines(&decode_entities(&html[start..end]));
    (!title.is_empty()).then_some(title)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Collapse runs of whitespace and drop empty lines.
fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
