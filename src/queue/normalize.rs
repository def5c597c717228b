//! URL 规范化：去重键
//!
//! 规则：小写；任意 scheme 统一为 https 源 + 路径；去掉默认端口、尾部斜杠、
//! 跟踪参数与 `/apply` 一类后缀；其余查询参数排序。幂等且全函数：无法解析的输入
//! 返回去空白、小写后的字符串。

use ::url::form_urlencoded;
use ::url::Url;

/// 常见跟踪参数（精确匹配）
const TRACKING_PARAMS: &[&str] = &[
    "ref",
    "refid",
    "ref_src",
    "trk",
    "trkinfo",
    "trackingid",
    "tracking_id",
    "fbclid",
    "gclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "src",
    "source",
    "from",
    "lipi",
];

/// 跟踪参数前缀
const TRACKING_PREFIXES: &[&str] = &["utm_", "_hs", "ga_"];

/// 部分站点在职位详情后附加的投递路径段
const APPLY_SUFFIXES: &[&str] = &[
    "apply",
    "apply-now",
    "applynow",
    "easy-apply",
    "easyapply",
    "application",
];

/// 规范化 URL，用作同一会话内的去重键
pub fn normalize_url(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let candidate = trim_tail(&lowered);
    if candidate.is_empty() {
        return String::new();
    }
    match parse_with_host(candidate) {
        Some(url) => canonicalize(&url),
        None => candidate.to_string(),
    }
}

fn trim_tail(s: &str) -> &str {
    s.trim_end_matches(|c: char| c == '/' || c.is_whitespace())
}

fn parse_with_host(input: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(input) {
        return has_host(&url).then_some(url);
    }
    if looks_like_bare_host(input) {
        return Url::parse(&format!("https://{input}"))
            .ok()
            .filter(has_host);
    }
    None
}

fn has_host(url: &Url) -> bool {
    url.host_str().is_some_and(|h| !h.is_empty())
}

/// `www.example.com/jobs/1` 这种缺少 scheme 的写法
fn looks_like_bare_host(input: &str) -> bool {
    if input.chars().any(char::is_whitespace) || input.contains("://") {
        return false;
    }
    let host = input
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    !host.starts_with('.')
        && host.contains('.')
        && host
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn canonicalize(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = match url.port() {
        None | Some(80) | Some(443) => String::new(),
        Some(p) => format!(":{p}"),
    };

    let mut segments: Vec<&str> = url.path().split('/').filter(|s| !s.is_empty()).collect();
    while segments
        .last()
        .is_some_and(|last| APPLY_SUFFIXES.contains(last))
    {
        segments.pop();
    }
    let path = if segments.is_empty() {
        String::new()
    } else {
        format!("/{}", segments.join("/"))
    };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
        .filter(|(k, _)| !is_tracking_param(k))
        .collect();
    pairs.sort();

    let mut out = format!("https://{host}{port}{path}");
    if !pairs.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_scheme_case_slash_and_tracking() {
        assert_eq!(
            normalize_url("HTTP://WWW.LinkedIn.com/jobs/view/123/?utm_source=mail&trk=abc"),
            "https://www.linkedin.com/jobs/view/123"
        );
    }

    #[test]
    fn test_collapses_apply_suffix() {
        assert_eq!(
            normalize_url("https://www.linkedin.com/jobs/view/123/apply/"),
            "https://www.linkedin.com/jobs/view/123"
        );
        assert_eq!(
            normalize_url("https://jobs.example.com/posting/9/apply-now"),
            normalize_url("https://jobs.example.com/posting/9")
        );
    }

    #[test]
    fn test_keeps_meaningful_query_sorted() {
        assert_eq!(
            normalize_url("www.indeed.com/viewjob?jk=abc123&from=serp&vjs=3"),
            "https://www.indeed.com/viewjob?jk=abc123&vjs=3"
        );
        assert_eq!(
            normalize_url("https://x.com/a?b=2&a=1"),
            normalize_url("https://x.com/a?a=1&b=2")
        );
    }

    #[test]
    fn test_default_ports_dropped() {
        assert_eq!(normalize_url("https://example.com:443/a"), "https://example.com/a");
        assert_eq!(normalize_url("http://example.com:80/a"), "https://example.com/a");
        assert_eq!(
            normalize_url("http://example.com:8080/a"),
            "https://example.com:8080/a"
        );
    }

    #[test]
    fn test_malformed_input_is_best_effort() {
        assert_eq!(normalize_url("  Not A URL  "), "not a url");
        assert_eq!(normalize_url(""), "");
        assert_eq!(normalize_url("   "), "");
        assert_eq!(normalize_url("mailto:HR@Example.com"), "mailto:hr@example.com");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "HTTP://WWW.LinkedIn.com/jobs/view/123/?utm_source=mail&trk=abc",
            "https://www.linkedin.com/jobs/view/123/apply/",
            "www.indeed.com/viewjob?jk=ABC&from=serp",
            "https://example.com:443/%C3%A9t%C3%A9?q=a%20b&Z=%41",
            "http://example.com:443/x",
            "https://example.com//a//b//",
            "https://example.com/?",
            "https://user:pw@example.com/a#frag",
            "  Not A URL  ",
            "abc.d /",
            "/",
            "https://",
            "javascript:void(0)",
            "file:///tmp/jobs/",
            "localhost:8080/jobs/",
            "http://[::1]:3000/jobs/apply",
            "https://host:99999/",
            "ÉCOLE.example/Offres/",
            "?utm_source=x",
        ];
        for sample in samples {
            let once = normalize_url(sample);
            let twice = normalize_url(&once);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }
}
