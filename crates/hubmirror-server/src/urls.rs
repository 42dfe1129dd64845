//! Small URL helpers shared by the pipeline and the API proxies.

use url::Url;

/// `host` or `host:port`, the way netlocs are written in the config.
pub fn netloc(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Path plus query plus fragment — everything after the authority.
pub fn url_tail(url: &Url) -> String {
    let mut tail = url.path().to_string();
    if let Some(query) = url.query() {
        tail.push('?');
        tail.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        tail.push('#');
        tail.push_str(fragment);
    }
    tail
}

/// Joins `tail` (an absolute path with optional query) onto a base like
/// `http://host:port`.
pub fn join_base(base: &str, tail: &str) -> Option<Url> {
    Url::parse(base).ok()?.join(tail).ok()
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn has_query_param(url: &Url, name: &str) -> bool {
    query_param(url, name).is_some()
}

pub fn add_query_param(url: &Url, name: &str, value: &str) -> Url {
    let mut out = url.clone();
    out.query_pairs_mut().append_pair(name, value);
    out
}

pub fn remove_query_param(url: &Url, name: &str) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut out = url.clone();
    out.set_query(None);
    if !pairs.is_empty() {
        out.query_pairs_mut().extend_pairs(pairs);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netloc_includes_non_default_ports() {
        let url = Url::parse("http://localhost:8090/a").unwrap();
        assert_eq!(netloc(&url), "localhost:8090");
        let url = Url::parse("https://huggingface.co/a").unwrap();
        assert_eq!(netloc(&url), "huggingface.co");
    }

    #[test]
    fn tail_keeps_query_and_fragment() {
        let url = Url::parse("https://cdn.example/abc?x=1#frag").unwrap();
        assert_eq!(url_tail(&url), "/abc?x=1#frag");
        let joined = join_base("http://mirror:8090", &url_tail(&url)).unwrap();
        assert_eq!(joined.as_str(), "http://mirror:8090/abc?x=1#frag");
    }

    #[test]
    fn query_params_round_trip_with_encoding() {
        let url = Url::parse("http://mirror:8090/abc?x=1").unwrap();
        let with = add_query_param(&url, "oriloc", "https://cdn.example/abc?x=1");
        assert_eq!(
            with.as_str(),
            "http://mirror:8090/abc?x=1&oriloc=https%3A%2F%2Fcdn.example%2Fabc%3Fx%3D1"
        );
        assert_eq!(
            query_param(&with, "oriloc").as_deref(),
            Some("https://cdn.example/abc?x=1")
        );
        let without = remove_query_param(&with, "oriloc");
        assert_eq!(without.as_str(), "http://mirror:8090/abc?x=1");
        assert!(!has_query_param(&without, "oriloc"));
    }
}
