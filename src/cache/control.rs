use std::time::Duration;

use http::HeaderMap;

/// A parsed `Cache-Control` header, covering exactly the directives the
/// strategy resolver consults: `no-cache`, `no-store`, `max-age`,
/// `min-fresh`, `max-stale`, `only-if-cached`, `must-revalidate`,
/// `public`, `private`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub min_fresh: Option<Duration>,
    /// `Some(None)` means `max-stale` was present with no value (accept
    /// any staleness); `Some(Some(d))` bounds the staleness to `d`;
    /// `None` means the directive was absent.
    pub max_stale: Option<Option<Duration>>,
    pub only_if_cached: bool,
    pub must_revalidate: bool,
    pub public: bool,
    pub private: bool,
}

impl CacheControl {
    /// Parses the `Cache-Control` header(s) out of `headers`. Multiple
    /// `Cache-Control` header lines and comma-separated directives within
    /// one line are both honored, mirroring how real user agents combine
    /// them.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = CacheControl::default();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let directive = directive.trim();
                let (name, arg) = match directive.split_once('=') {
                    Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.to_ascii_lowercase().as_str() {
                    "no-cache" => cc.no_cache = true,
                    "no-store" => cc.no_store = true,
                    "only-if-cached" => cc.only_if_cached = true,
                    "must-revalidate" => cc.must_revalidate = true,
                    "public" => cc.public = true,
                    "private" => cc.private = true,
                    "max-age" => cc.max_age = arg.and_then(parse_seconds),
                    "min-fresh" => cc.min_fresh = arg.and_then(parse_seconds),
                    "max-stale" => {
                        cc.max_stale = Some(arg.and_then(parse_seconds));
                    }
                    _ => {}
                }
            }
        }
        cc
    }
}

fn parse_seconds(s: &str) -> Option<Duration> {
    s.parse::<i64>().ok().map(|n| Duration::from_secs(n.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::CACHE_CONTROL, value.parse().unwrap());
        h
    }

    #[test]
    fn parses_max_age() {
        let cc = CacheControl::parse(&headers("max-age=3600, public"));
        assert_eq!(cc.max_age, Some(Duration::from_secs(3600)));
        assert!(cc.public);
    }

    #[test]
    fn parses_bare_max_stale() {
        let cc = CacheControl::parse(&headers("max-stale"));
        assert_eq!(cc.max_stale, Some(None));
    }

    #[test]
    fn parses_valued_max_stale() {
        let cc = CacheControl::parse(&headers("max-stale=60"));
        assert_eq!(cc.max_stale, Some(Some(Duration::from_secs(60))));
    }

    #[test]
    fn parses_no_store_and_no_cache() {
        let cc = CacheControl::parse(&headers("no-store, no-cache"));
        assert!(cc.no_store);
        assert!(cc.no_cache);
    }
}
