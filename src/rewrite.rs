//! Host/URL rewriting for mirrored content
//!
//! Finds URL-shaped substrings (absolute `http`, `https`, `ws`, `wss` or
//! scheme-relative `//host`) and moves them into the mirror's namespace:
//! links to the origin host are re-pointed at the mirror host, links to other
//! hosts are optionally routed through the `proxy_url` tunnel.

use crate::classify;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Query parameter carrying a percent-encoded tunnel target
pub const TUNNEL_PARAM: &str = "proxy_url";

/// Parameters of a rewrite pass
#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions<'a> {
    /// Authority of the origin being mirrored (host, optionally with port)
    pub old_host: &'a str,
    /// Authority of the mirror
    pub new_host: &'a str,
    /// Mirror is reached over TLS, so rewritten links use https/wss
    pub use_tls: bool,
    /// Route links to third-party hosts through the tunnel
    pub allow_external: bool,
    /// Third-party authorities never tunneled
    pub ignore: &'a [String],
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:(?P<scheme>https?|wss?):)?//(?P<host>\[[0-9a-f:.]+\]|[a-z0-9_](?:[a-z0-9_.\-]*[a-z0-9])?)(?P<port>:[0-9]{1,5})?(?P<rest>[/?#][^\s\x22'<>`\\{}|^()\[\]]*)?",
        )
        .expect("valid url regex")
    })
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])(\.([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]{0,61}[a-zA-Z0-9]))*$",
        )
        .expect("valid hostname regex")
    })
}

/// Whether `host` is a syntactically valid hostname or an IP literal
pub fn is_valid_host(host: &str) -> bool {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<IpAddr>().is_ok() || hostname_regex().is_match(host)
}

/// Rewrite every URL in `text` according to `opts`
pub fn rewrite_hosts(text: &str, opts: &RewriteOptions<'_>) -> String {
    rewrite_at_depth(text, opts, 0)
}

fn rewrite_at_depth(text: &str, opts: &RewriteOptions<'_>, depth: u8) -> String {
    url_regex()
        .replace_all(text, |caps: &Captures<'_>| rewrite_match(caps, opts, depth))
        .into_owned()
}

/// A matched URL split into the pieces the rewriter manipulates
struct UrlParts<'t> {
    scheme: Option<&'t str>,
    host: &'t str,
    port: &'t str,
    path: &'t str,
    query: Option<&'t str>,
    fragment: Option<&'t str>,
    /// Trailing punctuation that belongs to the surrounding text
    trailer: &'t str,
}

impl<'t> UrlParts<'t> {
    fn from_captures(caps: &Captures<'t>) -> Self {
        let rest = caps.name("rest").map(|m| m.as_str()).unwrap_or("");
        let trimmed = rest.trim_end_matches(['.', ',', ';', ':', '!', '?']);
        let trailer = &rest[trimmed.len()..];

        let (before_fragment, fragment) = match trimmed.split_once('#') {
            Some((b, f)) => (b, Some(f)),
            None => (trimmed, None),
        };
        let (path, query) = match before_fragment.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (before_fragment, None),
        };

        Self {
            scheme: caps.name("scheme").map(|m| m.as_str()),
            host: caps.name("host").map(|m| m.as_str()).unwrap_or(""),
            port: caps.name("port").map(|m| m.as_str()).unwrap_or(""),
            path,
            query,
            fragment,
            trailer,
        }
    }

    fn authority(&self) -> String {
        format!("{}{}", self.host, self.port)
    }

    /// Render with the given scheme, authority and query, excluding the trailer
    fn render(&self, scheme: Option<&str>, authority: &str, query: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(scheme) = scheme {
            out.push_str(scheme);
            out.push(':');
        }
        out.push_str("//");
        out.push_str(authority);
        out.push_str(self.path);
        if let Some(query) = query {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

fn rewrite_match(caps: &Captures<'_>, opts: &RewriteOptions<'_>, depth: u8) -> String {
    let original = caps.get(0).map(|m| m.as_str()).unwrap_or("");
    let parts = UrlParts::from_captures(caps);

    if !is_valid_host(parts.host) {
        return original.to_string();
    }

    let authority = parts.authority();

    // Already points at the mirror; only the scheme may need normalizing
    if authority.eq_ignore_ascii_case(opts.new_host) {
        let scheme = parts.scheme.map(|s| normalize_scheme(s, opts.use_tls));
        let query = parts.query;
        return parts.render(scheme, &authority, query) + parts.trailer;
    }

    let query = parts
        .query
        .map(|q| rewrite_query(q, opts, depth))
        .map(Cow::into_owned);

    if authority.eq_ignore_ascii_case(opts.old_host) {
        let scheme = parts.scheme.map(|s| normalize_scheme(s, opts.use_tls));
        return parts.render(scheme, opts.new_host, query.as_deref()) + parts.trailer;
    }

    if !opts.allow_external
        || opts
            .ignore
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&authority) || h.eq_ignore_ascii_case(parts.host))
    {
        return original.to_string();
    }

    let Some(scheme) = parts.scheme else {
        return original.to_string();
    };
    if classify::is_image_path(parts.path) {
        return original.to_string();
    }

    let tunnel_scheme = normalize_scheme(scheme, opts.use_tls);
    let target = parts.render(Some(scheme), &authority, query.as_deref());
    format!(
        "{}://{}/?{}={}{}",
        tunnel_scheme,
        opts.new_host,
        TUNNEL_PARAM,
        urlencoding::encode(&target),
        parts.trailer
    )
}

/// Force the scheme family to match the mirror's transport
fn normalize_scheme(scheme: &str, use_tls: bool) -> &'static str {
    let websocket = scheme.to_ascii_lowercase().starts_with("ws");
    match (websocket, use_tls) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    }
}

/// Rewrite URLs nested in query values, one level of percent-decoding deep
fn rewrite_query<'q>(query: &'q str, opts: &RewriteOptions<'_>, depth: u8) -> Cow<'q, str> {
    if depth > 0 || query.is_empty() {
        return Cow::Borrowed(query);
    }

    let mut changed = false;
    let pairs: Vec<Cow<'q, str>> = query
        .split('&')
        .map(|pair| {
            let Some((key, value)) = pair.split_once('=') else {
                return Cow::Borrowed(pair);
            };

            let rewritten = match urlencoding::decode(value) {
                Ok(decoded) => {
                    let nested = rewrite_at_depth(&decoded, opts, depth + 1);
                    if nested == decoded {
                        None
                    } else {
                        Some(urlencoding::encode(&nested).into_owned())
                    }
                }
                Err(_) => {
                    let nested = rewrite_at_depth(value, opts, depth + 1);
                    (nested != value).then_some(nested)
                }
            };

            match rewritten {
                Some(value) => {
                    changed = true;
                    Cow::Owned(format!("{}={}", key, value))
                }
                None => Cow::Borrowed(pair),
            }
        })
        .collect();

    if changed {
        Cow::Owned(pairs.join("&"))
    } else {
        Cow::Borrowed(query)
    }
}

/// Extract and decode the tunnel target from a raw query string
pub fn tunnel_target(raw_query: &str) -> Option<String> {
    raw_query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == TUNNEL_PARAM)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(Cow::into_owned)
        .filter(|target| !target.is_empty())
}
