//! Markdown post-processing: image link rewriting, figure placeholders,
//! public URL construction and normalization of converter output.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::fingerprint::fingerprint_bytes;
use crate::scanner::normalize_rel_path;

static MD_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[(?P<alt>[^\]]*)\]\((?P<url>[^)]+)\)").unwrap());
static HTML_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\s+[^>]*src=["'](?P<url>[^"']+)["'][^>]*>"#).unwrap()
});
static HTML_ALT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)alt=["']([^"']*)["']"#).unwrap());

static TABLE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\|?\s*:?-+:?\s*(\|\s*:?-+:?\s*)+\|?\s*$").unwrap()
});
static NOISE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9/.-]+$").unwrap());
static UNIT_READING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(\.\d+)?\s*(Hz|kHz|MHz|GHz|V|mV|A|mA|dB|dBm|dBuV|W|mW|%|Ohm|ohm)\b").unwrap()
});
static ORDERED_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\.\s+").unwrap());

/// Lines seen this many times outside code are page headers or footers.
const REPEAT_THRESHOLD: usize = 3;

pub const FIGURES_SECTION: &str = "Images (auto-caption)";

/// Where an image link should point after rewriting, plus what we know
/// about the image.
#[derive(Debug, Clone, Default)]
pub struct ImageLink {
    pub public_url: String,
    pub caption: Option<String>,
    pub title: Option<String>,
}

/// A figure placeholder emitted into the markdown body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Figure {
    pub figure_id: String,
    /// Normalized link target as it appeared in the source markdown.
    pub link: String,
    pub public_url: String,
    pub caption: Option<String>,
}

/// `FIG-<first 12 hex of sha256(rel_path)>`, stable per source path.
pub fn figure_prefix(rel_path: &str) -> String {
    if rel_path.is_empty() {
        return "FIG".to_string();
    }
    format!("FIG-{}", fingerprint_bytes(rel_path.as_bytes()).short())
}

/// Replace every known relative image link with `[ImageRef: <id>]` and
/// append a figures section listing each image with its caption.
pub fn rewrite_with_placeholders(
    markdown: &str,
    links: &HashMap<String, ImageLink>,
    prefix: &str,
) -> (String, Vec<Figure>) {
    let mut figures: Vec<(Figure, String)> = Vec::new();

    let mut add_figure = |alt: &str, url: &str| -> Option<String> {
        let clean = clean_url(url);
        if !is_relative_url(clean) {
            return None;
        }
        let normalized = normalize_rel_path(clean);
        let link = links.get(&normalized)?;
        let figure_id = format!("{}-{:03}", prefix, figures.len() + 1);
        let label = link
            .title
            .clone()
            .or_else(|| link.caption.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| Some(alt.to_string()).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| figure_id.clone());
        figures.push((
            Figure {
                figure_id: figure_id.clone(),
                link: normalized,
                public_url: link.public_url.clone(),
                caption: link.caption.clone(),
            },
            label,
        ));
        Some(format!("[ImageRef: {}]", figure_id))
    };

    let body = MD_IMAGE.replace_all(markdown, |caps: &Captures| {
        add_figure(&caps["alt"], caps["url"].trim()).unwrap_or_else(|| caps[0].to_string())
    });
    let body = HTML_IMAGE
        .replace_all(&body, |caps: &Captures| {
            let alt = extract_html_alt(&caps[0]);
            add_figure(&alt, caps["url"].trim()).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();

    if figures.is_empty() {
        return (cleanup(&body), Vec::new());
    }

    let mut out = body.trim_end().to_string();
    out.push_str("\n\n## ");
    out.push_str(FIGURES_SECTION);
    out.push('\n');
    for (figure, label) in &figures {
        out.push_str(&format!("### {}\n", figure.figure_id));
        out.push_str(&format!("![{}]({})\n", label, figure.public_url));
        if let Some(caption) = &figure.caption {
            out.push_str(&format!("\nCaption: {}\n", caption));
        }
        out.push('\n');
    }

    (
        cleanup(&out),
        figures.into_iter().map(|(figure, _)| figure).collect(),
    )
}

/// Point relative image links at new URLs, leaving everything else alone.
pub fn rewrite_links(markdown: &str, links: &HashMap<String, String>) -> String {
    let lookup = |url: &str| -> Option<&String> {
        let clean = clean_url(url);
        if !is_relative_url(clean) {
            return None;
        }
        links.get(&normalize_rel_path(clean))
    };

    let body = MD_IMAGE.replace_all(markdown, |caps: &Captures| match lookup(caps["url"].trim()) {
        Some(new_url) => format!("![{}]({})", &caps["alt"], new_url),
        None => caps[0].to_string(),
    });
    HTML_IMAGE
        .replace_all(&body, |caps: &Captures| {
            let raw = &caps[0];
            let url = &caps["url"];
            match lookup(url.trim()) {
                Some(new_url) => raw.replace(url, new_url),
                None => raw.to_string(),
            }
        })
        .into_owned()
}

/// Relative image targets referenced by a markdown document, normalized and
/// deduplicated in order of appearance.
pub fn relative_image_links(markdown: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let urls = MD_IMAGE
        .captures_iter(markdown)
        .chain(HTML_IMAGE.captures_iter(markdown))
        .map(|caps| caps["url"].trim().to_string());
    for url in urls {
        let clean = clean_url(&url);
        if !is_relative_url(clean) {
            continue;
        }
        let normalized = normalize_rel_path(clean);
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

/// Not absolute, not a scheme we should leave alone, not an anchor.
pub fn is_relative_url(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    !(lowered.starts_with("http://")
        || lowered.starts_with("https://")
        || lowered.starts_with("data:")
        || lowered.starts_with("file:")
        || lowered.starts_with('/')
        || lowered.starts_with('#'))
}

fn clean_url(url: &str) -> &str {
    url.strip_prefix('<')
        .and_then(|u| u.strip_suffix('>'))
        .unwrap_or(url)
}

fn extract_html_alt(tag: &str) -> String {
    HTML_ALT
        .captures(tag)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default()
}

/// `<base>/<prefix>/<rel_path>` with the path part percent-encoded.
/// Without a base the result is a relative URL.
pub fn build_public_url(base_url: &str, prefix: &str, rel_path: &str) -> String {
    let base = if base_url.is_empty() {
        String::new()
    } else {
        format!("{}/", base_url.trim_end_matches('/'))
    };
    let prefix = prefix.trim_matches('/');
    let rel_path = rel_path.trim_start_matches('/');
    let combined = [prefix, rel_path]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");
    format!("{}{}", base, percent_encode_path(&combined))
}

/// Public URL of a file under the output root.
pub fn public_url_for(path: &Path, output_root: &Path, base_url: &str, prefix: &str) -> String {
    let relative = path.strip_prefix(output_root).unwrap_or(path);
    let rel = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    build_public_url(base_url, prefix, &normalize_rel_path(&rel))
}

fn percent_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'/' | b'-' | b'_' | b'.' | b'~' | b'%' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Strip trailing spaces, collapse blank-line runs, end with one newline.
pub fn cleanup(markdown: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut blank = false;
    for line in markdown.lines().map(str::trim_end) {
        if line.is_empty() {
            if blank {
                continue;
            }
            blank = true;
        } else {
            blank = false;
        }
        out.push(line);
    }
    let joined = out.join("\n");
    format!("{}\n", joined.trim())
}

/// Tidy converter output for retrieval.
///
/// - drops extraction noise: bare unit readings, short all-caps labels and
///   short code-like tokens with digits (axis ticks, page numbers)
/// - drops short non-sentence lines repeated [`REPEAT_THRESHOLD`] or more
///   times (running headers and footers)
/// - rejoins paragraphs split across lines or page breaks
/// - keeps tables separated from surrounding text by a blank line
///
/// Fenced code, headings, lists, tables and image lines pass through.
pub fn normalize(markdown: &str) -> String {
    let lines: Vec<&str> = markdown.lines().collect();
    let lines = drop_noise(&lines);
    let lines = drop_repeated(&lines);
    let lines = separate_tables(&lines);
    cleanup(&merge_paragraphs(&lines).join("\n"))
}

/// Per-line flag: inside (or delimiting) a fenced code block.
fn code_mask(lines: &[&str]) -> Vec<bool> {
    let mut in_code = false;
    lines
        .iter()
        .map(|line| {
            if line.starts_with("```") {
                in_code = !in_code;
                true
            } else {
                in_code
            }
        })
        .collect()
}

fn drop_noise<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mask = code_mask(lines);
    lines
        .iter()
        .zip(mask)
        .filter(|(line, code)| *code || is_block_line(line) || !is_noise_line(line))
        .map(|(line, _)| *line)
        .collect()
}

fn drop_repeated<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mask = code_mask(lines);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (line, code) in lines.iter().zip(&mask) {
        if !code && is_repeat_candidate(line) {
            *counts.entry(collapse_whitespace(line)).or_default() += 1;
        }
    }
    lines
        .iter()
        .zip(mask)
        .filter(|(line, code)| {
            *code
                || !is_repeat_candidate(line)
                || counts
                    .get(&collapse_whitespace(line))
                    .map_or(true, |n| *n < REPEAT_THRESHOLD)
        })
        .map(|(line, _)| *line)
        .collect()
}

fn separate_tables<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mask = code_mask(lines);
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let starts_table = !mask[i]
            && is_table_row(lines[i])
            && lines.get(i + 1).is_some_and(|next| is_table_separator(next));
        if !starts_table {
            out.push(lines[i]);
            i += 1;
            continue;
        }
        if out.last().is_some_and(|l| !l.trim().is_empty()) {
            out.push("");
        }
        while i < lines.len() && (is_table_row(lines[i]) || is_table_separator(lines[i])) {
            out.push(lines[i]);
            i += 1;
        }
        if lines.get(i).is_some_and(|l| !l.trim().is_empty()) {
            out.push("");
        }
    }
    out
}

fn merge_paragraphs(lines: &[&str]) -> Vec<String> {
    fn flush(out: &mut Vec<String>, paragraph: &mut Option<String>) {
        if let Some(p) = paragraph.take() {
            out.push(p);
            out.push(String::new());
        }
    }

    let mut out: Vec<String> = Vec::new();
    let mut paragraph: Option<String> = None;
    let mut in_code = false;
    for &line in lines {
        if line.starts_with("```") {
            flush(&mut out, &mut paragraph);
            in_code = !in_code;
            out.push(line.to_string());
            continue;
        }
        if in_code {
            out.push(line.to_string());
            continue;
        }
        let text = line.trim();
        if text.is_empty() {
            if paragraph.is_some() {
                flush(&mut out, &mut paragraph);
            } else if out.last().is_some_and(|l| !l.is_empty()) {
                out.push(String::new());
            }
            continue;
        }
        if is_block_line(line) {
            flush(&mut out, &mut paragraph);
            out.push(line.to_string());
            continue;
        }
        paragraph = Some(match paragraph.take() {
            None => text.to_string(),
            Some(current) if should_merge(&current, text) => format!("{} {}", current, text),
            Some(current) => {
                out.push(current);
                out.push(String::new());
                text.to_string()
            }
        });
    }
    if let Some(p) = paragraph {
        out.push(p);
    }
    out
}

/// A paragraph continues unless it already ends a sentence and both halves
/// are long enough to stand alone.
fn should_merge(current: &str, incoming: &str) -> bool {
    !ends_sentence(current) || current.chars().count() < 80 || incoming.chars().count() < 40
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end().ends_with(['.', '!', '?'])
}

fn is_noise_line(line: &str) -> bool {
    let s = line.trim();
    if s.is_empty() {
        return false;
    }
    if UNIT_READING.is_match(s) {
        return true;
    }
    if s.len() <= 12 && NOISE_TOKEN.is_match(s) && s.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    s.chars().count() <= 3
        && s.chars().any(char::is_alphabetic)
        && !s.chars().any(char::is_lowercase)
}

fn is_repeat_candidate(line: &str) -> bool {
    let s = line.trim();
    !s.is_empty()
        && !s.starts_with(['#', '-', '*'])
        && !is_table_row(s)
        && !is_table_separator(s)
        && s.chars().count() <= 80
        && !ends_sentence(s)
}

fn is_block_line(line: &str) -> bool {
    let s = line.trim_start();
    s.starts_with(['#', '>'])
        || s.starts_with("- ")
        || s.starts_with("* ")
        || s.starts_with("+ ")
        || s.starts_with("![")
        || s.starts_with("[ImageRef:")
        || ORDERED_ITEM.is_match(s)
        || is_table_row(s)
        || is_table_separator(s)
}

fn is_table_row(line: &str) -> bool {
    let s = line.trim();
    s.contains('|') && (s.starts_with('|') || s.ends_with('|') || s.matches('|').count() >= 2)
}

fn is_table_separator(line: &str) -> bool {
    TABLE_SEPARATOR.is_match(line.trim())
}

fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links() -> HashMap<String, ImageLink> {
        HashMap::from([
            (
                "artifacts/image_0.png".to_string(),
                ImageLink {
                    public_url: "https://cdn.example.com/docling/images/report/image_0.png"
                        .to_string(),
                    caption: Some("Quarterly revenue chart".to_string()),
                    title: Some("Revenue".to_string()),
                },
            ),
            (
                "artifacts/image_1.png".to_string(),
                ImageLink {
                    public_url: "https://cdn.example.com/i1.png".to_string(),
                    caption: None,
                    title: None,
                },
            ),
        ])
    }

    #[test]
    fn replaces_links_with_placeholders_and_appends_section() {
        let md = "# Report\n\n![chart](./artifacts/image_0.png)\n\nText.\n\n<img src=\"artifacts/image_1.png\" alt=\"logo\">\n\n![remote](https://x.org/a.png)\n";
        let (out, figures) = rewrite_with_placeholders(md, &links(), "FIG-abc");

        assert!(out.contains("[ImageRef: FIG-abc-001]"));
        assert!(out.contains("[ImageRef: FIG-abc-002]"));
        assert!(out.contains("![remote](https://x.org/a.png)"));
        assert!(out.contains("## Images (auto-caption)"));
        assert!(out.contains("### FIG-abc-001\n![Revenue](https://cdn.example.com/docling/images/report/image_0.png)"));
        assert!(out.contains("Caption: Quarterly revenue chart"));
        assert!(out.contains("### FIG-abc-002\n![logo](https://cdn.example.com/i1.png)"));
        assert!(out.ends_with('\n') && !out.ends_with("\n\n"));

        assert_eq!(figures.len(), 2);
        assert_eq!(figures[0].link, "artifacts/image_0.png");
        assert_eq!(figures[1].caption, None);
    }

    #[test]
    fn no_known_images_leaves_body_untouched() {
        let md = "# Title\n\n![x](missing.png)\n";
        let (out, figures) = rewrite_with_placeholders(md, &HashMap::new(), "FIG");
        assert_eq!(out, md);
        assert!(figures.is_empty());
    }

    #[test]
    fn figure_prefix_is_stable() {
        let a = figure_prefix("reports/q3.pdf");
        assert_eq!(a, figure_prefix("reports/q3.pdf"));
        assert_eq!(a.len(), "FIG-".len() + 12);
        assert_ne!(a, figure_prefix("reports/q4.pdf"));
    }

    #[test]
    fn rewrites_relative_links_in_place() {
        let map = HashMap::from([("img/a.png".to_string(), "https://h/a.png".to_string())]);
        let md = "![a](<img/a.png>) ![b](img/b.png) <img alt=\"a\" src=\"./img/a.png\">";
        let out = rewrite_links(md, &map);
        assert_eq!(
            out,
            "![a](https://h/a.png) ![b](img/b.png) <img alt=\"a\" src=\"https://h/a.png\">"
        );
    }

    #[test]
    fn collects_relative_links_once() {
        let md = "![a](img/a.png) ![a2](./img/a.png) ![c](https://x/c.png) ![d](/abs.png)";
        assert_eq!(relative_image_links(md), vec!["img/a.png"]);
    }

    #[test]
    fn public_url_encoding() {
        assert_eq!(
            build_public_url("https://cdn.example.com/", "/kb/", "markdown/My Report.md"),
            "https://cdn.example.com/kb/markdown/My%20Report.md"
        );
        assert_eq!(build_public_url("", "", "a/b.md"), "a/b.md");
        assert_eq!(build_public_url("http://h", "", "图.png"), "http://h/%E5%9B%BE.png");
        assert_eq!(
            public_url_for(
                Path::new("/out/data/markdown/a.md"),
                Path::new("/out/data"),
                "http://h",
                "p"
            ),
            "http://h/p/markdown/a.md"
        );
    }

    #[test]
    fn cleanup_collapses_blank_lines() {
        assert_eq!(cleanup("a  \n\n\n\nb\n\n"), "a\n\nb\n");
    }

    #[test]
    fn normalize_tidies_converter_output() {
        let raw = "\
# Power Supply Test Report

ACME Labs Confidential
The unit was tested at nominal input
voltage and full load for two hours.

12.5 MHz
BW
A1-3

ACME Labs Confidential
Output ripple stayed within limits.
| Test | Result |
|------|--------|
| Ripple | Pass |
Further notes follow.

ACME Labs Confidential

```
ACME Labs Confidential
5 V
```
";
        let out = normalize(raw);
        assert_eq!(out.matches("ACME Labs Confidential").count(), 1, "{}", out);
        assert!(out.contains(
            "The unit was tested at nominal input voltage and full load for two hours."
        ));
        assert!(!out.contains("12.5 MHz"));
        assert!(!out.contains("\nBW\n"));
        assert!(!out.contains("A1-3"));
        assert!(out.contains("Output ripple stayed within limits.\n\n| Test | Result |"));
        assert!(out.contains("| Ripple | Pass |\n\nFurther notes follow."));
        assert!(out.contains("```\nACME Labs Confidential\n5 V\n```"));
        assert!(out.starts_with("# Power Supply Test Report\n\n"));
    }

    #[test]
    fn normalize_keeps_long_sentences_apart_and_headings_intact() {
        let first = "This opening paragraph is long enough that it clearly stands on its own as a full sentence.";
        let second = "The following paragraph is also long enough to stand on its own here.";
        let out = normalize(&format!("## A\n{}\n{}\n- item one\n- item two\n", first, second));
        assert_eq!(
            out,
            format!("## A\n{}\n\n{}\n\n- item one\n- item two\n", first, second)
        );
    }
}
