//! Page enrichment for mirrored HTML
//!
//! Runs after host rewriting. Text-level stages (dictionary replacement,
//! injection markers, friend links) operate on the markup string; the back-link
//! insertion and the final title/meta pass work on the parsed [`Document`].
//!
//! Descriptor JSON that fails to decode disables only the stage it feeds; the
//! failure is logged once per page.

use crate::classify;
use crate::convert::ScriptConverter;
use crate::dom::{Document, Element, Node, Visitor};
use crate::site::{
    present, ContentTitle, DateMacros, HrefInjections, ImageInjections, PageMeta,
    ParagraphInjections, SiteRecord,
};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset};
use regex::{NoExpand, Regex};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::OnceLock;
use tracing::warn;

/// Go reference-time layout tokens and their strftime equivalents, longest first
/// wherever two tokens share a prefix
const GO_LAYOUT_TOKENS: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Monday", "%A"),
    ("2006", "%Y"),
    ("-07:00", "%:z"),
    ("Z07:00", "%:z"),
    ("-0700", "%z"),
    (".000", "%.3f"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("002", "%j"),
    ("01", "%m"),
    ("02", "%d"),
    ("_2", "%e"),
    ("15", "%H"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("PM", "%p"),
    ("pm", "%P"),
    ("1", "%-m"),
    ("2", "%-d"),
    ("3", "%-I"),
    ("4", "%-M"),
    ("5", "%-S"),
];

/// Request-specific inputs of a page rewrite
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    pub site: &'a SiteRecord,
    /// Mirror hostname the page is served on
    pub host: &'a str,
    /// Request path
    pub path: &'a str,
    /// Time used for date macros
    pub now: DateTime<FixedOffset>,
}

impl PageContext<'_> {
    fn is_home(&self) -> bool {
        classify::is_home_page(self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HtmlOutput {
    pub html: String,
    /// Filtered friend-link block to persist for the site, if it changed
    pub friend_link_update: Option<String>,
}

/// Apply every enrichment stage to an already host-rewritten page
pub fn rewrite_page(
    html: &str,
    ctx: &PageContext<'_>,
    converter: &dyn ScriptConverter,
) -> HtmlOutput {
    let site = ctx.site;

    let mut body = apply_replaces(html, site);
    body = strip_integrity(&body);

    if !ctx.is_home() {
        body = insert_back_link(body, &site.title);
    }

    let mut friend_link_update = None;
    if ctx.is_home() {
        if let Some(raw) = present(&site.friend_link) {
            let filtered = filter_friend_links(raw, ctx.host);
            body = body.replace("</body>", &format!("{}</body>", filtered));
            if !site.link_up || filtered.trim() != raw {
                friend_link_update = Some(filtered);
            }
        }
    }

    body = apply_date_macros(body, ctx);
    body = apply_images(body, site);
    body = apply_hrefs(body, site);
    body = apply_paragraphs(body, site);

    if site.script_convert {
        body = converter.convert(&body);
    }

    HtmlOutput {
        html: rewrite_head(&body, ctx),
        friend_link_update,
    }
}

/// Decode a descriptor, logging and discarding it on failure
fn decode_descriptor<T: DeserializeOwned>(site: &SiteRecord, stage: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(site_id = site.id, stage, error = %e, "Ignoring malformed site descriptor");
            None
        }
    }
}

fn apply_replaces(html: &str, site: &SiteRecord) -> String {
    let raw = site.replaces.trim();
    if raw.is_empty() {
        return html.to_string();
    }
    let Some(pairs) = decode_descriptor::<HashMap<String, String>>(site, "replaces", raw) else {
        return html.to_string();
    };

    let mut keys: Vec<&String> = pairs.keys().filter(|k| !k.is_empty()).collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut body = html.to_string();
    for key in keys {
        if body.contains(key.as_str()) {
            body = body.replace(key.as_str(), &pairs[key]);
        }
    }
    body
}

fn integrity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\sintegrity="[^"]+""#).expect("valid integrity regex"))
}

fn strip_integrity(html: &str) -> String {
    integrity_regex()
        .replace_all(html, "")
        .replace(r#"http-equiv="Content-Security-Policy""#, "")
}

/// Put `<a href="/">title</a>` before the first `<p>`, or the last `<div>`
fn insert_back_link(html: String, title: &str) -> String {
    let mut doc = Document::parse(&html);
    let Some(path) = doc
        .find_first(|e| e.is("p"))
        .or_else(|| doc.find_last(|e| e.is("div")))
    else {
        return html;
    };

    let anchor = Element::new("a").with_attr("href", "/").with_text(title);
    doc.insert_before(&path, Node::Element(anchor));
    doc.render()
}

/// Unescape the stored block, keep anchors that do not mention `host`,
/// one per line
pub fn filter_friend_links(raw: &str, host: &str) -> String {
    let unescaped = unescape_entities(raw);
    let mut out = String::new();
    for piece in unescaped.split_inclusive("</a>") {
        let piece = piece.trim();
        if piece.is_empty() || piece.contains(host) {
            continue;
        }
        out.push_str(piece);
        out.push('\n');
    }
    out
}

fn apply_date_macros(mut body: String, ctx: &PageContext<'_>) -> String {
    let site = ctx.site;
    let Some(raw) = present(&site.date_macros) else {
        return body;
    };
    let Some(macros) = decode_descriptor::<DateMacros>(site, "date_macros", raw) else {
        return body;
    };

    for item in macros.list {
        if item.position.is_empty() || !body.contains(&item.position) {
            continue;
        }
        match format_date(&ctx.now, &item.date) {
            Some(formatted) => body = body.replace(&item.position, &formatted),
            None => warn!(site_id = site.id, format = %item.date, "Invalid date macro format"),
        }
    }
    body
}

fn apply_images(mut body: String, site: &SiteRecord) -> String {
    let Some(raw) = present(&site.images) else {
        return body;
    };
    let raw = unescape_entities(raw);
    let Some(injections) = decode_descriptor::<ImageInjections>(site, "images", &raw) else {
        return body;
    };

    for item in injections.list {
        if item.position.is_empty() || !body.contains(&item.position) {
            continue;
        }
        let mut replacement = item.position.clone();
        for image in &item.image {
            let _ = write!(replacement, "<img src={}> ", image);
        }
        body = body.replace(&item.position, &replacement);
    }
    body
}

fn anchor_text_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r">(.*?)</a>").expect("valid anchor text regex"))
}

fn apply_hrefs(mut body: String, site: &SiteRecord) -> String {
    let Some(raw) = present(&site.random_href) else {
        return body;
    };
    let raw = unescape_entities(raw);
    let Some(injections) = decode_descriptor::<HrefInjections>(site, "random_href", &raw) else {
        return body;
    };

    for item in injections.list {
        if item.position.is_empty() || !body.contains(&item.position) {
            continue;
        }
        let label = format!(">{}</a>", item.prefix);
        let anchors = anchor_text_regex().replace_all(&item.random_href, NoExpand(&label));
        body = body.replace(&item.position, &anchors);
    }
    body
}

fn apply_paragraphs(mut body: String, site: &SiteRecord) -> String {
    let Some(raw) = present(&site.random_content) else {
        return body;
    };
    let raw = unescape_entities(raw);
    let Some(injections) =
        decode_descriptor::<ParagraphInjections>(site, "random_content", &raw)
    else {
        return body;
    };

    for item in injections.list {
        if item.position.is_empty() || !body.contains(&item.position) {
            continue;
        }
        let content: String = item
            .random_content
            .iter()
            .map(|c| format!("{}\n ", c))
            .collect();
        body = body.replace(&item.position, &content);
    }
    body
}

/// Format `now` with a strftime pattern, or a reference-time layout when the
/// pattern has no `%`
pub fn format_date(now: &DateTime<FixedOffset>, pattern: &str) -> Option<String> {
    let strftime: Cow<'_, str> = if pattern.contains('%') {
        Cow::Borrowed(pattern)
    } else {
        Cow::Owned(go_layout_to_strftime(pattern))
    };

    if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
        return None;
    }

    let mut out = String::new();
    write!(out, "{}", now.format_with_items(StrftimeItems::new(&strftime))).ok()?;
    Some(out)
}

fn go_layout_to_strftime(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;

    'outer: while let Some(c) = rest.chars().next() {
        for (token, spec) in GO_LAYOUT_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = tail;
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Replace character references with the characters they denote
pub fn unescape_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        match candidate.find(';').filter(|end| *end <= 10) {
            Some(end) => match decode_entity(&candidate[1..end]) {
                Some(c) => {
                    out.push(c);
                    rest = &candidate[end + 1..];
                }
                None => {
                    out.push('&');
                    rest = &candidate[1..];
                }
            },
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => None,
    }
}

/// Title, meta and charset values chosen for the page
struct HeadRewriter<'a> {
    title: Option<&'a str>,
    keywords: Option<&'a str>,
    description: Option<&'a str>,
}

impl Visitor for HeadRewriter<'_> {
    fn visit_element(&mut self, element: &mut Element) {
        if element.is("title") {
            if let Some(title) = self.title {
                element.set_text(title);
            }
        } else if element.is("meta") {
            self.rewrite_meta(element);
        }
    }
}

impl HeadRewriter<'_> {
    fn rewrite_meta(&self, meta: &mut Element) {
        let mut content = None;

        if let Some(name) = meta.attr("name") {
            if name.eq_ignore_ascii_case("keywords") {
                content = self.keywords;
            } else if name.eq_ignore_ascii_case("description") {
                content = self.description;
            }
        }
        if meta
            .attr("http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("content-type"))
        {
            content = Some("text/html; charset=UTF-8");
        }

        for (key, value) in meta.attrs.iter_mut() {
            if key.eq_ignore_ascii_case("charset") {
                *value = "UTF-8".to_string();
            }
        }

        let Some(content) = content.filter(|c| !c.is_empty()) else {
            return;
        };
        for (key, value) in meta.attrs.iter_mut() {
            if key.eq_ignore_ascii_case("content") {
                *value = content.to_string();
            }
        }
    }
}

fn rewrite_head(html: &str, ctx: &PageContext<'_>) -> String {
    let site = ctx.site;
    let overrides: Option<ContentTitle> = if ctx.is_home() {
        None
    } else {
        present(&site.content_title)
            .and_then(|raw| decode_descriptor(site, "content_title", raw))
    };

    let mut rewriter = if ctx.is_home() {
        HeadRewriter {
            title: Some(site.seo_title.as_str()),
            keywords: Some(site.keywords.as_str()),
            description: Some(site.description.as_str()),
        }
    } else {
        let meta: Option<&PageMeta> = overrides.as_ref().and_then(|o| o.for_path(ctx.path));
        HeadRewriter {
            title: meta.and_then(|m| m.title.as_deref()),
            keywords: meta.and_then(|m| m.keywords.as_deref()),
            description: meta.and_then(|m| m.description.as_deref()),
        }
    };

    let mut doc = Document::parse(html);
    doc.walk_mut(&mut rewriter);
    doc.render()
}
