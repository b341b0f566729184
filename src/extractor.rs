//! Public endpoint detection in tunnel process output

use regex::Regex;

/// Domain under which cloudflared quick tunnels are published
pub const DEFAULT_PROVIDER_DOMAIN: &str = "trycloudflare.com";

/// Recognises a published endpoint in one line of process output
pub trait UrlExtractor: Send + Sync {
    /// Return the first endpoint URL in `line`, if any
    fn extract<'a>(&self, line: &'a str) -> Option<&'a str>;
}

/// Matches `http(s)://<label>.<provider-domain>`
#[derive(Debug, Clone)]
pub struct ProviderUrlExtractor {
    pattern: Regex,
}

impl ProviderUrlExtractor {
    /// Build an extractor for hosts under `domain`
    pub fn new(domain: &str) -> Result<Self, regex::Error> {
        let pattern = format!(r"https?://[a-zA-Z0-9-]+\.{}", regex::escape(domain));
        Ok(Self {
            pattern: Regex::new(&pattern)?,
        })
    }

    /// Extractor for cloudflared quick tunnels
    pub fn cloudflare() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_PROVIDER_DOMAIN)
    }
}

impl UrlExtractor for ProviderUrlExtractor {
    fn extract<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.pattern.find(line).map(|m| m.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_from_cloudflared_banner() {
        let extractor = ProviderUrlExtractor::cloudflare().unwrap();
        let line = "2024-05-01T10:00:00Z INF |  https://abcd-1234.trycloudflare.com                                 |";

        assert_eq!(
            extractor.extract(line),
            Some("https://abcd-1234.trycloudflare.com")
        );
    }

    #[test]
    fn test_plain_http_and_first_match() {
        let extractor = ProviderUrlExtractor::cloudflare().unwrap();
        let line = "see http://one.trycloudflare.com and https://two.trycloudflare.com";

        assert_eq!(extractor.extract(line), Some("http://one.trycloudflare.com"));
    }

    #[test]
    fn test_no_match() {
        let extractor = ProviderUrlExtractor::cloudflare().unwrap();

        for line in [
            "INF Requesting new quick Tunnel on trycloudflare.com...",
            "HTTPS://abcd.trycloudflare.com",
            "https://abcd.trycloudflare",
            "https://",
            "",
        ] {
            assert_eq!(extractor.extract(line), None, "line: {:?}", line);
        }
    }

    #[test]
    fn test_split_url_does_not_match() {
        let extractor = ProviderUrlExtractor::cloudflare().unwrap();

        assert_eq!(extractor.extract("https://abcd-12"), None);
        assert_eq!(extractor.extract("34.trycloudflare.com"), None);
    }

    #[test]
    fn test_custom_domain_is_escaped() {
        let extractor = ProviderUrlExtractor::new("tunnels.example.org").unwrap();

        assert_eq!(
            extractor.extract("url=https://abc.tunnels.example.org/"),
            Some("https://abc.tunnels.example.org")
        );
        assert_eq!(extractor.extract("https://abc.tunnelsXexample.org"), None);
    }
}
