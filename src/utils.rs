//! Utility functions for reading and normalising proxy lists.

use reqwest::Client;

/// Read a proxy list from a URL or a local file path.
pub(crate) async fn read_location(client: &Client, location: &str) -> Result<String, crate::error::SourceError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let response = client.get(location).send().await?.error_for_status()?;
        Ok(response.text().await?)
    } else {
        Ok(tokio::fs::read_to_string(location).await?)
    }
}

/// Parse text content into `host:port` endpoints, one per line.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(normalize_endpoint)
        .collect()
}

/// Reduce a raw endpoint to canonical `host:port`.
///
/// Accepts an optional `scheme://` prefix and trailing whitespace-separated
/// annotations; rejects anything without a numeric, non-zero port.
pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let raw = raw.split_whitespace().next()?;
    let without_scheme = match raw.find("://") {
        Some(idx) => &raw[idx + 3..],
        None => raw,
    };
    let without_path = without_scheme.trim_end_matches('/');

    let (host, port) = without_path.rsplit_once(':')?;
    if host.is_empty() || host.contains('/') || host.contains('@') {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }

    Some(format!("{}:{}", host.to_ascii_lowercase(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("1.2.3.4:8080"), Some("1.2.3.4:8080".to_string()));
        assert_eq!(
            normalize_endpoint("http://1.2.3.4:3128/"),
            Some("1.2.3.4:3128".to_string())
        );
        assert_eq!(
            normalize_endpoint("Proxy.Example.com:80 elite"),
            Some("proxy.example.com:80".to_string())
        );

        assert_eq!(normalize_endpoint("1.2.3.4"), None);
        assert_eq!(normalize_endpoint("1.2.3.4:http"), None);
        assert_eq!(normalize_endpoint("1.2.3.4:0"), None);
        assert_eq!(normalize_endpoint("1.2.3.4:70000"), None);
        assert_eq!(normalize_endpoint(":8080"), None);
    }

    #[test]
    fn test_parse_proxy_list() {
        let content = "# free list\n1.2.3.4:8080\n\n  5.6.7.8:3128  \nnot a proxy\nsocks5://9.9.9.9:1080\n";
        assert_eq!(
            parse_proxy_list(content),
            vec!["1.2.3.4:8080", "5.6.7.8:3128", "9.9.9.9:1080"]
        );
    }

    #[tokio::test]
    async fn test_read_location_missing_file_is_error() {
        let client = Client::new();
        let result = read_location(&client, "/nonexistent/proxy-list.txt").await;
        assert!(result.is_err());
    }
}
