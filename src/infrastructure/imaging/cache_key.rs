//! URL normalisation filters for deriving cache keys.

use std::sync::Arc;

use regex::Regex;
use reqwest::Url;

use crate::domain::entities::CacheKey;

/// Caller-supplied normalisation from URL to cache key.
pub type CacheKeyFilter = Arc<dyn Fn(&Url) -> CacheKey + Send + Sync>;

/// Key without the query string and fragment, for CDNs that sign or version URLs.
#[must_use]
pub fn strip_query_filter() -> CacheKeyFilter {
    Arc::new(|url: &Url| {
        let mut url = url.clone();
        url.set_query(None);
        url.set_fragment(None);
        CacheKey::from_url(&url)
    })
}

/// Key with every match of `pattern` removed from the URL string.
#[must_use]
pub fn pattern_filter(pattern: Regex) -> CacheKeyFilter {
    Arc::new(move |url: &Url| CacheKey::new(pattern.replace_all(url.as_str(), "").into_owned()))
}

/// Builds the filter described by configuration, if any.
///
/// The query is stripped before the pattern is applied.
///
/// # Errors
/// Returns error if `pattern` is not a valid regular expression.
pub fn filter_from_settings(
    strip_query: bool,
    pattern: Option<&str>,
) -> Result<Option<CacheKeyFilter>, regex::Error> {
    let pattern = pattern
        .filter(|p| !p.is_empty())
        .map(Regex::new)
        .transpose()?;

    Ok(match (strip_query, pattern) {
        (false, None) => None,
        (true, None) => Some(strip_query_filter()),
        (false, Some(re)) => Some(pattern_filter(re)),
        (true, Some(re)) => {
            let strip = strip_query_filter();
            let combined: CacheKeyFilter = Arc::new(move |url: &Url| {
                let stripped = strip(url);
                CacheKey::new(re.replace_all(stripped.as_str(), "").into_owned())
            });
            Some(combined)
        }
    })
}
