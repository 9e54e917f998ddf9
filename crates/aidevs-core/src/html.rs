// HTML scraping: the login page question, cleaned page text and link lists.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HtmlError {
    #[error("Question not found in HTML")]
    QuestionNotFound,
}

static QUESTION_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p#human-question").expect("static selector"));

static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static selector"));

static INVISIBLE_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\u{200B}-\u{200F}\u{FEFF}\u{2060}-\u{2064}\u{206A}-\u{206F}\u{E000}-\u{F8FF}\u{E0000}-\u{E007F}]",
    )
    .expect("static invisible pattern")
});

/// Characters a printable-only copy drops: controls, format and private-use
/// characters, unassigned code points and every separator except ` `.
static NON_PRINTABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[[\p{C}\p{Zl}\p{Zp}\p{Zs}]--[\x20]]").expect("static non-printable pattern")
});

/// Hidden attribute values longer than this get decoded variants appended.
const LONG_HIDDEN_VALUE: usize = 50;

/// Extract the anti-bot question from the login page.
pub fn extract_question(html: &str) -> Result<String, HtmlError> {
    let document = Html::parse_document(html);
    let p = document
        .select(&QUESTION_SELECTOR)
        .next()
        .ok_or(HtmlError::QuestionNotFound)?;

    let joined: String = p.text().map(str::trim).collect();
    Ok(joined.replace("Question:", "").trim().to_string())
}

/// Readable text of an HTML document without `script`/`style`, one phrase
/// per line, followed by a `HIDDEN DATA:` section with `data-*` attributes.
pub fn clean_html_content(html: &str) -> String {
    let document = Html::parse_document(html);

    let mut raw = String::new();
    for node in document.root_element().descendants() {
        if let Node::Text(text) = node.value() {
            let hidden = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| matches!(e.name(), "script" | "style"))
            });
            if !hidden {
                raw.push_str(text);
            }
        }
    }

    let mut clean = raw
        .lines()
        .flat_map(|line| line.trim().split("  "))
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let hidden = hidden_attribute_data(&document);
    if !hidden.is_empty() {
        debug!(items = hidden.len(), "found hidden data attributes");
        clean.push_str("\n\nHIDDEN DATA:\n");
        clean.push_str(&hidden.join("\n"));
    }
    clean
}

fn hidden_attribute_data(document: &Html) -> Vec<String> {
    let mut out = Vec::new();
    for node in document.root_element().descendants() {
        let Some(element) = node.value().as_element() else {
            continue;
        };
        for (name, value) in element.attrs() {
            if !name.starts_with("data-") {
                continue;
            }
            out.push(format!("Hidden {name}: {value}"));
            if value.chars().count() <= LONG_HIDDEN_VALUE {
                continue;
            }

            let cleaned = INVISIBLE_CHARS.replace_all(value, "");
            if cleaned != value {
                out.push(format!("Cleaned {name}: {cleaned}"));
            }
            let ascii: String = value.chars().filter(char::is_ascii).collect();
            if !ascii.is_empty() && ascii != value {
                out.push(format!("ASCII filter {name}: {ascii}"));
            }
            let printable = NON_PRINTABLE.replace_all(value, "");
            if !printable.is_empty() && printable != value {
                out.push(format!("Printable only {name}: {printable}"));
            }
        }
    }
    out
}

/// A crawled page reduced to readable text plus the links worth following.
#[derive(Debug, Clone, PartialEq)]
pub struct PageContent {
    pub text: String,
    pub links: Vec<PageLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    pub url: String,
    pub label: String,
}

/// Reduce a page to its text and de-duplicated absolute links on the same
/// host as `page_url`. Fragments, `mailto:`, `tel:` and `javascript:` links
/// are dropped.
pub fn page_text_and_links(html: &str, page_url: &Url) -> PageContent {
    let document = Html::parse_document(html);
    let text = clean_html_content(html);

    let mut links: Vec<PageLink> = Vec::new();
    for anchor in document.select(&LINK_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
        {
            continue;
        }
        let Ok(mut absolute) = page_url.join(href) else {
            continue;
        };
        absolute.set_fragment(None);
        if absolute.host_str() != page_url.host_str() {
            continue;
        }
        let url = absolute.to_string();
        if links.iter().any(|l| l.url == url) {
            continue;
        }
        links.push(PageLink {
            url,
            label: anchor_label(&anchor),
        });
    }

    PageContent { text, links }
}

fn anchor_label(anchor: &ElementRef<'_>) -> String {
    let label = anchor
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if label.is_empty() {
        anchor.value().attr("title").unwrap_or_default().to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_question() {
        let html = r#"<html><body><form>
            <p id="human-question">Question:<br />Rok zdobycia Konstantynopola?</p>
        </form></body></html>"#;
        assert_eq!(
            extract_question(html).unwrap(),
            "Rok zdobycia Konstantynopola?"
        );
    }

    #[test]
    fn missing_question() {
        assert_eq!(
            extract_question("<p id=\"other\">x</p>"),
            Err(HtmlError::QuestionNotFound)
        );
    }

    #[test]
    fn clean_skips_scripts_and_styles() {
        let html = r#"<html><head><style>p { color: red }</style>
            <script>var secret = 1;</script></head>
            <body><h1>Tytuł</h1>
            <p>Pierwsze  zdanie</p>
            <p>   </p><p>Drugie</p></body></html>"#;
        let clean = clean_html_content(html);
        assert_eq!(clean, "Tytuł\nPierwsze\nzdanie\nDrugie");
    }

    #[test]
    fn clean_keeps_inline_markup_on_one_line() {
        let clean = clean_html_content("<html><body><p>Ala <b>ma</b> kota</p></body></html>");
        assert_eq!(clean, "Ala ma kota");

        let html = "<div>Autor: <a href=\"/a\">Aldous Huxley</a>, 1932</div>\n<div>Drugi  wiersz</div>";
        assert_eq!(clean_html_content(html), "Autor: Aldous Huxley, 1932\nDrugi\nwiersz");
    }

    #[test]
    fn printable_copy_drops_format_and_separator_chars() {
        let value = format!("a\u{00AD}b\u{00A0}c d\u{2028}e{}", "x".repeat(60));
        let clean = clean_html_content(&format!(r#"<i data-x="{value}"></i>"#));
        assert!(clean.contains(&format!("Printable only data-x: abc de{}", "x".repeat(60))));
    }

    #[test]
    fn clean_reports_hidden_data() {
        let long = format!("ukryte{}dane{}", "\u{200B}", "x".repeat(60));
        let html = format!(
            r#"<div data-short="abc">Widoczne</div><span data-wtf="{long}"></span>"#
        );
        let clean = clean_html_content(&html);

        assert!(clean.starts_with("Widoczne\n\nHIDDEN DATA:\n"));
        assert!(clean.contains("Hidden data-short: abc"));
        assert!(clean.contains(&format!("Cleaned data-wtf: ukrytedane{}", "x".repeat(60))));
        assert!(clean.contains("ASCII filter data-wtf: ukrytedane"));
    }

    #[test]
    fn links_are_absolute_same_host_and_unique() {
        let page = Url::parse("https://softo.example/portfolio/").unwrap();
        let html = r##"
            <a href="/kontakt">Kontakt</a>
            <a href="projekt-1#top"><span>Projekt</span> <b>1</b></a>
            <a href="https://softo.example/kontakt">Kontakt 2</a>
            <a href="https://other.example/">Obcy</a>
            <a href="mailto:x@softo.example">Mail</a>
            <a href="#anchor">Kotwica</a>
            <a href="/blog" title="Blog firmowy"></a>
        "##;

        let content = page_text_and_links(html, &page);
        let urls: Vec<&str> = content.links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://softo.example/kontakt",
                "https://softo.example/portfolio/projekt-1",
                "https://softo.example/blog",
            ]
        );
        assert_eq!(content.links[1].label, "Projekt 1");
        assert_eq!(content.links[2].label, "Blog firmowy");
        assert!(content.text.contains("Kontakt"));
    }
}
