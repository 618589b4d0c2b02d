use url::form_urlencoded;

pub const CACHE_KEY_PREFIX: &str = "cms:cache:";

/// Decode a raw query string into its parameter pairs.
///
/// A parameter given several times (`tag=a&tag=b`) yields one pair per value,
/// which is how list-valued parameters travel through the proxy.
pub fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    form_urlencoded::parse(raw.as_bytes())
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Build a canonical cache key:
/// - resource path trimmed of surrounding slashes
/// - query parameters stable-sorted by name (values of a repeated name keep their order)
/// - query re-encoded in a stable form
/// - `?` always present, so "no query" and "empty query" share a key
pub fn derive_key(resource_path: &str, query: &[(String, String)]) -> String {
    let path = resource_path.trim().trim_matches('/');

    let mut params: Vec<(&str, &str)> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    // sort_by is stable
    params.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();

    format!("{CACHE_KEY_PREFIX}{path}?{canonical_query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn key_is_invariant_to_parameter_order() {
        let a = derive_key("entries", &pairs(&[("limit", "10"), ("content_type", "post")]));
        let b = derive_key("entries", &pairs(&[("content_type", "post"), ("limit", "10")]));
        assert_eq!(a, b);
        assert_eq!(a, "cms:cache:entries?content_type=post&limit=10");
    }

    #[test]
    fn empty_query_uses_explicit_marker() {
        assert_eq!(derive_key("entries", &[]), "cms:cache:entries?");
        assert_eq!(
            derive_key("entries", &parse_query(Some(""))),
            derive_key("entries", &parse_query(None))
        );
    }

    #[test]
    fn different_resources_or_parameters_differ() {
        let list = derive_key("entries", &[]);
        let item = derive_key("entries/abc", &[]);
        let assets = derive_key("assets", &[]);
        let limited = derive_key("entries", &pairs(&[("limit", "1")]));
        let limited_more = derive_key("entries", &pairs(&[("limit", "2")]));

        let keys = [&list, &item, &assets, &limited, &limited_more];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn repeated_parameters_keep_value_order() {
        let ab = derive_key("entries", &pairs(&[("tag", "a"), ("limit", "5"), ("tag", "b")]));
        let ba = derive_key("entries", &pairs(&[("tag", "b"), ("tag", "a"), ("limit", "5")]));
        assert_eq!(ab, "cms:cache:entries?limit=5&tag=a&tag=b");
        assert_ne!(ab, ba);
    }

    #[test]
    fn values_are_reencoded_consistently() {
        let raw = parse_query(Some("fields.title%5Bmatch%5D=hello%20world&order=-sys.createdAt"));
        let plus = parse_query(Some("order=-sys.createdAt&fields.title[match]=hello+world"));
        assert_eq!(derive_key("entries", &raw), derive_key("entries", &plus));
    }

    #[test]
    fn parse_query_drops_empty_segments() {
        let parsed = parse_query(Some("a=1&&=x&b"));
        assert_eq!(parsed, pairs(&[("a", "1"), ("b", "")]));
    }
}
