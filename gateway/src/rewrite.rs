//! Outbound path construction.
//!
//! The rewritten path keeps the suffix segments of the inbound path, with
//! each segment re-encoded so that characters like `@` and `+` in path
//! parameters (an email address, say) survive as a single segment. Existing
//! percent-escapes pass through untouched. The inbound query string is
//! carried over verbatim.

use crate::routing::{Rewrite, RouteRule};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use url::Url;

/// Matches JS `encodeURIComponent`: everything but ASCII alphanumerics and
/// `-_.~!*'()` is escaped. `%` is kept so already-encoded input is not
/// double-encoded.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'%');

pub fn encode_segment(raw: &str) -> String {
    utf8_percent_encode(raw, COMPONENT).to_string()
}

/// Applies the matched rule to the inbound path, producing the outbound path.
pub fn rewrite_path(rule: &RouteRule, path: &str) -> String {
    let suffix = &path[rule.prefix.len()..];
    let mut out = match &rule.rewrite {
        Rewrite::StripPrefix => String::new(),
        Rewrite::ReplacePrefix(with) => with.clone(),
    };

    for segment in suffix.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(&encode_segment(segment));
    }

    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Combines a backend base URL with the rewritten path and the original
/// query string.
pub fn build_target_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    url.set_path(path);
    url.set_query(query);
    url
}
