//! Path and content-type classification shared by the cloak policy, the cache
//! and the transform pipeline.

/// Request paths that all denote a site's home page.
const HOME_ALIASES: &[&str] = &[
    "",
    "/",
    "/index.php",
    "/index.asp",
    "/index.jsp",
    "/index.htm",
    "/index.html",
    "/index.shtml",
    "/main.htm",
];

const SCRIPT_PAGE_EXTS: &[&str] = &["php", "asp", "aspx", "jsp", "shtml"];

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Cache key every home page alias collapses to
pub const HOME_CACHE_KEY: &str = "/index.html";

const IMAGE_EXTS: &[&str] = &[
    ".jpg", ".jpeg", ".ico", ".gif", ".webp", ".png", ".pjpeg", ".JPG",
];

const STATIC_EXTS: &[&str] = &[
    ".xml", ".yml", ".yaml", ".css", ".js", ".jsm", ".txt", ".text", ".json", ".woff",
];

/// Whether `path` is one of the home page aliases (ASCII case-insensitive)
pub fn is_home_page(path: &str) -> bool {
    HOME_ALIASES.iter().any(|alias| alias.eq_ignore_ascii_case(path))
}

/// Map a request path to the path used as cache key
pub fn canonical_path(path: &str) -> &str {
    if is_home_page(path) {
        HOME_CACHE_KEY
    } else {
        path
    }
}

/// Extension of the last path segment including the leading dot, or "" if none.
///
/// Mirrors `filepath.Ext` semantics: a dot inside a directory name does not count.
pub fn extension(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rfind('.') {
        Some(idx) => &last[idx..],
        None => "",
    }
}

pub fn is_image_ext(ext: &str) -> bool {
    IMAGE_EXTS.contains(&ext)
}

pub fn is_static_ext(ext: &str) -> bool {
    STATIC_EXTS.contains(&ext)
}

pub fn is_image_path(path: &str) -> bool {
    is_image_ext(extension(path))
}

/// Broad class of a response body, derived from its `Content-Type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Xml,
    /// Text that is decoded and cached but not rewritten (css, js, json, plain text)
    Text,
    Image,
    /// Anything else; passed through untouched
    Binary,
}

impl ContentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        let mime = ct.split(';').next().unwrap_or("").trim();

        if mime.contains("html") {
            ContentKind::Html
        } else if mime.contains("xml") {
            ContentKind::Xml
        } else if mime.starts_with("image/") {
            ContentKind::Image
        } else if mime.starts_with("text/")
            || mime.contains("javascript")
            || mime.contains("ecmascript")
            || mime.contains("json")
            || mime.contains("yaml")
        {
            ContentKind::Text
        } else {
            ContentKind::Binary
        }
    }

    /// Whether the body goes through decode/normalize/re-encode
    pub fn is_textual(self) -> bool {
        matches!(self, ContentKind::Html | ContentKind::Xml | ContentKind::Text)
    }
}

/// Whether a content type denotes JavaScript
pub fn is_javascript(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("javascript") || ct.contains("ecmascript")
}

/// Content type used when serving a cached file, derived from its key's extension.
///
/// Server-side script pages and extension-less paths are mirrored markup. Text
/// types carry `charset=utf-8` since cached text is stored normalized.
pub fn content_type_for_path(path: &str) -> String {
    let ext = extension(path).trim_start_matches('.');
    if ext.is_empty() || SCRIPT_PAGE_EXTS.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
        return HTML_CONTENT_TYPE.to_string();
    }

    let mime = mime_guess::from_ext(ext).first_or_octet_stream();
    let essence = mime.essence_str();
    if essence.contains("php") || essence.contains("asp") {
        HTML_CONTENT_TYPE.to_string()
    } else if mime.type_() == mime_guess::mime::TEXT && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", essence)
    } else {
        mime.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_aliases_collapse_to_index() {
        assert_eq!(canonical_path("/"), "/index.html");
        assert_eq!(canonical_path("/index.html"), "/index.html");
        assert_eq!(canonical_path("/index.php"), "/index.html");
        assert_eq!(canonical_path("/INDEX.PHP"), "/index.html");
        assert_eq!(canonical_path(""), "/index.html");
        assert_eq!(canonical_path("/news/1.html"), "/news/1.html");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("/a/b.png"), ".png");
        assert_eq!(extension("/a.dir/b"), "");
        assert_eq!(extension("/a/b.tar.gz"), ".gz");
        assert_eq!(extension("/a/b.js?v=1"), ".js");
        assert_eq!(extension("/"), "");
    }

    #[test]
    fn test_image_and_static() {
        assert!(is_image_path("/logo.png"));
        assert!(is_image_path("/photo.JPG"));
        assert!(!is_image_path("/photo.Png"));
        assert!(is_static_ext(".css"));
        assert!(!is_static_ext(".html"));
    }

    #[test]
    fn test_content_kind() {
        assert_eq!(
            ContentKind::from_content_type("text/html; charset=gbk"),
            ContentKind::Html
        );
        assert_eq!(
            ContentKind::from_content_type("application/xhtml+xml"),
            ContentKind::Html
        );
        assert_eq!(
            ContentKind::from_content_type("application/rss+xml"),
            ContentKind::Xml
        );
        assert_eq!(
            ContentKind::from_content_type("application/javascript"),
            ContentKind::Text
        );
        assert_eq!(ContentKind::from_content_type("image/png"), ContentKind::Image);
        assert_eq!(
            ContentKind::from_content_type("application/octet-stream"),
            ContentKind::Binary
        );
    }

    #[test]
    fn test_content_type_for_path() {
        assert_eq!(content_type_for_path("/index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for_path("/page.php"), "text/html; charset=utf-8");
        assert_eq!(content_type_for_path("/a.css"), "text/css; charset=utf-8");
        assert_eq!(content_type_for_path("/a.png"), "image/png");
        assert_eq!(content_type_for_path("/news/42"), "text/html; charset=utf-8");
    }

    #[test]
    fn test_content_type_for_non_html_text() {
        assert_eq!(content_type_for_path("/data.csv"), "text/csv; charset=utf-8");
        assert_eq!(content_type_for_path("/feed.rss"), "application/rss+xml");
        assert_eq!(content_type_for_path("/blob.zzqx"), "application/octet-stream");
        assert!(!content_type_for_path("/notes.md").starts_with("text/html"));
        assert!(!content_type_for_path("/font.ttf").starts_with("text/html"));
    }
}
