//! Readable text from fetched HTML pages.

use scraper::{ElementRef, Html, Selector};

/// Candidate roots for the main content, most specific first.
const CONTENT_ROOTS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    "#content",
    ".content",
    ".post-content",
    ".article-content",
    ".entry-content",
    "body",
];

const BLOCKS: &str = "h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td";

/// Never part of readable content.
const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form", "svg",
];

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "pre", "blockquote", "td",
];

/// Whether a response body should go through [`html_to_text`].
pub fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    if let Some(content_type) = content_type {
        return content_type.to_ascii_lowercase().contains("html");
    }
    let head: String = body.trim_start().chars().take(16).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Reduce an HTML document to markdown-flavoured text: headings, paragraphs,
/// and list items of the main content, without scripts or page chrome.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let Some(root) = content_root(&document) else {
        return String::new();
    };

    let blocks = Selector::parse(BLOCKS).ok();
    let mut out = Vec::new();
    if let Some(blocks) = &blocks {
        for element in root.select(blocks) {
            if has_ancestor(&element, SKIPPED) || has_ancestor(&element, BLOCK_TAGS) {
                continue;
            }
            let text = collapse(&element);
            if text.is_empty() {
                continue;
            }
            out.push(match element.value().name() {
                "h1" => format!("# {text}"),
                "h2" => format!("## {text}"),
                "h3" | "h4" | "h5" | "h6" => format!("### {text}"),
                "li" => format!("- {text}"),
                "blockquote" => format!("> {text}"),
                _ => text,
            });
        }
    }

    if out.is_empty() {
        // Pages without block markup: keep the bare text nodes.
        let text = root
            .descendants()
            .filter_map(|node| {
                let text = node.value().as_text()?;
                let skipped = node.ancestors().any(|ancestor| {
                    ancestor
                        .value()
                        .as_element()
                        .is_some_and(|el| SKIPPED.contains(&el.name()))
                });
                (!skipped).then(|| String::from(&**text))
            })
            .collect::<Vec<_>>()
            .join(" ");
        return text.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    out.join("\n\n")
}

fn content_root(document: &Html) -> Option<ElementRef<'_>> {
    CONTENT_ROOTS.iter().find_map(|candidate| {
        let selector = Selector::parse(candidate).ok()?;
        document
            .select(&selector)
            .find(|element| !collapse(element).is_empty())
    })
}

fn has_ancestor(element: &ElementRef<'_>, names: &[&str]) -> bool {
    element.ancestors().any(|ancestor| {
        ancestor
            .value()
            .as_element()
            .is_some_and(|el| names.contains(&el.name()))
    })
}

fn collapse(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
