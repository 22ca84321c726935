use url::Url;

/// Returns true if `raw` parses as an absolute http or https URL.
///
/// Item links from feeds are frequently relative paths, `mailto:` addresses,
/// or plain garbage; only absolute web URLs are worth unfurling.
pub fn is_http_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_http_urls_accepted() {
        assert!(is_http_url("https://example.com/post/1"));
        assert!(is_http_url("http://news.example.org:8080/a?b=c"));
    }

    #[test]
    fn test_other_schemes_rejected() {
        assert!(!is_http_url("ftp://example.com/file"));
        assert!(!is_http_url("mailto:author@example.com"));
        assert!(!is_http_url("file:///etc/passwd"));
    }

    #[test]
    fn test_relative_and_garbage_rejected() {
        assert!(!is_http_url("/post/1"));
        assert!(!is_http_url("post 1 with spaces"));
        assert!(!is_http_url(""));
    }
}
