//! Joining the configured server address with endpoint paths.

/// Strips trailing slashes so endpoint joins never produce `//`.
///
/// ```
/// use streamturn::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://agents.example.com/"), "https://agents.example.com");
/// assert_eq!(normalize_base_url("https://agents.example.com///"), "https://agents.example.com");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Joins `base_url` and `endpoint` with exactly one slash between them.
///
/// ```
/// use streamturn::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://agents.example.com/", "/api/agent/conversation/list"),
///     "https://agents.example.com/api/agent/conversation/list"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}
