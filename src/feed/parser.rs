//! Feed XML parsing and GUID normalization.

use anyhow::Result;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};

/// Parsed feed header plus items, decoupled from the wire format.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone)]
pub struct ParsedItem {
    /// Already normalized (see [`normalize_guid`]).
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Parses RSS or Atom bytes into a [`ParsedFeed`].
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = parser::parse(bytes)?;

    let items: Vec<ParsedItem> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let title = entry.title.map(|t| t.content);
            let guid = normalize_guid(&entry.id, link.as_deref(), title.as_deref());

            ParsedItem {
                guid,
                title,
                link,
                summary: entry.summary.map(|s| s.content),
                content: entry.content.and_then(|c| c.body),
                published: entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.with_timezone(&Utc)),
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        description: feed.description.map(|d| d.content),
        items,
    })
}

/// Collapses a raw entry ID to a stable value.
///
/// Some generators emit GUIDs that churn on every publish: the same link
/// and title with an incrementing trailing fragment (`link#0`, `link#5`, …).
/// The fragment is stripped so repeat fetches converge on one identity.
/// An empty GUID falls back to a hash of link and title, so feeds without
/// IDs still dedupe deterministically.
///
/// Normalization is idempotent: applying it to its own output is a no-op.
pub fn normalize_guid(raw: &str, link: Option<&str>, title: Option<&str>) -> String {
    let trimmed = strip_unstable_fragment(raw.trim());
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    let input = format!("{}|{}", link.unwrap_or(""), title.unwrap_or(""));
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn strip_unstable_fragment(guid: &str) -> &str {
    match guid.rsplit_once('#') {
        Some((base, fragment))
            if !base.is_empty()
                && !fragment.is_empty()
                && fragment.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => guid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RSS_SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <description>A test feed</description>
    <item>
      <title>Item 1</title>
      <link>https://example.com/item1</link>
      <guid>item-1</guid>
      <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
      <description>This is item 1</description>
    </item>
    <item>
      <title>Item 2</title>
      <link>https://example.com/item2</link>
      <guid>item-2</guid>
    </item>
  </channel>
</rss>"#;

    const ATOM_SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Test Feed</title>
  <entry>
    <title>Atom Entry 1</title>
    <link href="https://example.com/atom1"/>
    <id>atom-entry-1</id>
    <updated>2024-01-01T00:00:00Z</updated>
    <summary>This is Atom entry 1</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss() {
        let feed = parse_feed(RSS_SAMPLE.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Test Feed"));
        assert_eq!(feed.description.as_deref(), Some("A test feed"));
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].guid, "item-1");
        assert_eq!(feed.items[0].link.as_deref(), Some("https://example.com/item1"));
        assert!(feed.items[0].published.is_some());
        assert!(feed.items[1].published.is_none());
    }

    #[test]
    fn test_parse_atom() {
        let feed = parse_feed(ATOM_SAMPLE.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Atom Test Feed"));
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].guid, "atom-entry-1");
        assert_eq!(feed.items[0].summary.as_deref(), Some("This is Atom entry 1"));
    }

    #[test]
    fn test_empty_feed_parses_to_zero_items() {
        let empty = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>E</title></channel></rss>"#;
        let feed = parse_feed(empty.as_bytes()).unwrap();
        assert_eq!(feed.items.len(), 0);
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(parse_feed(b"<not valid xml").is_err());
    }

    #[test]
    fn test_trailing_fragment_collapsed() {
        let link = Some("https://example.com/post");
        let title = Some("Post");
        let a = normalize_guid("https://example.com/post#0", link, title);
        let b = normalize_guid("https://example.com/post#5", link, title);
        let c = normalize_guid("https://example.com/post#10", link, title);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a, "https://example.com/post");
    }

    #[test]
    fn test_non_numeric_fragment_kept() {
        let guid = normalize_guid("https://example.com/post#section", None, None);
        assert_eq!(guid, "https://example.com/post#section");
    }

    #[test]
    fn test_empty_guid_hashes_link_and_title() {
        let a = normalize_guid("", Some("https://example.com/x"), Some("X"));
        let b = normalize_guid("  ", Some("https://example.com/x"), Some("X"));
        let c = normalize_guid("", Some("https://example.com/y"), Some("X"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // sha256 hex
    }

    proptest! {
        #[test]
        fn prop_normalization_idempotent(
            raw in ".{0,64}",
            link in proptest::option::of("[a-z]{1,16}"),
            title in proptest::option::of("[a-z]{1,16}"),
        ) {
            let once = normalize_guid(&raw, link.as_deref(), title.as_deref());
            let twice = normalize_guid(&once, link.as_deref(), title.as_deref());
            prop_assert_eq!(once, twice);
        }
    }
}
