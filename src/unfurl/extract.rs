//! Page metadata extraction for link previews.
//!
//! OpenGraph and Twitter-card values, when present and non-empty, win over
//! plain HTML (`<title>`, `<meta name="description">`, `<link rel=icon>`).
//! A page with broken or absent OpenGraph tags still yields whatever the
//! plain-HTML path finds.

use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use url::Url;

/// What one page yielded. All fields optional; `extra` carries every
/// `og:`/`twitter:` property verbatim.
#[derive(Debug, Clone, Default)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub favicon_url: Option<String>,
    pub extra: BTreeMap<String, String>,
}

struct Selectors {
    title: Selector,
    meta: Selector,
    icon: Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: OnceLock<Selectors> = OnceLock::new();
    // Literal selectors; parse cannot fail.
    SELECTORS.get_or_init(|| Selectors {
        title: Selector::parse("title").expect("valid selector"),
        meta: Selector::parse("meta[content]").expect("valid selector"),
        icon: Selector::parse("link[rel][href]").expect("valid selector"),
    })
}

/// Extracts preview metadata from `html`, resolving relative image and icon
/// URLs against `page_url`. Never fails; an unparseable page yields an
/// empty record (plus the favicon guess when the URL has an origin).
pub fn extract(page_url: &str, html: &str) -> PageMetadata {
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);
    let selectors = selectors();

    // First occurrence of each og:/twitter: property wins.
    let mut extra: BTreeMap<String, String> = BTreeMap::new();
    for element in document.select(&selectors.meta) {
        let attrs = element.value();
        let Some(key) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if !key.starts_with("og:") && !key.starts_with("twitter:") {
            continue;
        }
        let Some(content) = attrs.attr("content").map(str::trim) else {
            continue;
        };
        if !content.is_empty() {
            extra.entry(key).or_insert_with(|| content.to_string());
        }
    }

    let title = extra
        .get("og:title")
        .or_else(|| extra.get("twitter:title"))
        .cloned()
        .or_else(|| html_title(&document, selectors));

    let description = extra
        .get("og:description")
        .or_else(|| extra.get("twitter:description"))
        .cloned()
        .or_else(|| meta_description(&document, selectors));

    let image_url = extra
        .get("og:image")
        .or_else(|| extra.get("twitter:image"))
        .and_then(|raw| resolve(base.as_ref(), raw));

    let favicon_url = icon_link(&document, selectors)
        .and_then(|raw| resolve(base.as_ref(), &raw))
        .or_else(|| favicon_guess(base.as_ref()));

    PageMetadata {
        title,
        description,
        image_url,
        favicon_url,
        extra,
    }
}

fn html_title(document: &Html, selectors: &Selectors) -> Option<String> {
    document
        .select(&selectors.title)
        .next()
        .map(|el| el.text().collect::<String>())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn meta_description(document: &Html, selectors: &Selectors) -> Option<String> {
    document
        .select(&selectors.meta)
        .find(|el| {
            el.value()
                .attr("name")
                .is_some_and(|name| name.eq_ignore_ascii_case("description"))
        })
        .and_then(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

/// First `<link>` whose rel tokens include an icon variant.
fn icon_link(document: &Html, selectors: &Selectors) -> Option<String> {
    document
        .select(&selectors.icon)
        .find(|el| {
            el.value().attr("rel").is_some_and(|rel| {
                rel.split_ascii_whitespace()
                    .any(|token| token.to_ascii_lowercase().contains("icon"))
            })
        })
        .and_then(|el| el.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
}

/// Unverified same-origin `/favicon.ico` guess for pages without an icon
/// link.
fn favicon_guess(base: Option<&Url>) -> Option<String> {
    base.and_then(|b| b.join("/favicon.ico").ok())
        .map(String::from)
}

fn resolve(base: Option<&Url>, raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    match base {
        Some(base) => base.join(raw).ok().map(String::from),
        None => Url::parse(raw).ok().map(String::from),
    }
}
