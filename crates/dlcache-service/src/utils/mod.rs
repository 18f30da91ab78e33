pub mod http;

/// Replaces the query string of a URL, which may contain download tokens, for logging.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("mods.factorio.com/download/foo?username=a&token=b"),
            "mods.factorio.com/download/foo?<redacted>"
        );
        assert_eq!(
            redact_query("factorio.com/api/latest-releases"),
            "factorio.com/api/latest-releases"
        );
        assert_eq!(redact_query("a?b?c"), "a?<redacted>");
    }
}
