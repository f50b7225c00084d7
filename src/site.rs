//! Site records and the JSON descriptors stored alongside them

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One mirrored site: where it comes from, what host it is served on and how
/// its pages are enriched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub id: i64,
    /// Bound mirror hostname, `None` while the record waits in the pending queue
    pub host: Option<String>,
    pub origin_url: String,
    /// Label of the back-link inserted into inner pages
    pub title: String,
    /// Home page `<title>`
    pub seo_title: String,
    pub keywords: String,
    pub description: String,
    /// Title/meta overrides for inner pages, see [`PageMeta`]
    pub content_title: Option<String>,
    /// Anchor block appended to the home page
    pub friend_link: Option<String>,
    /// [`DateMacros`] JSON
    pub date_macros: Option<String>,
    /// [`ImageInjections`] JSON
    pub images: Option<String>,
    /// [`HrefInjections`] JSON
    pub random_href: Option<String>,
    /// [`ParagraphInjections`] JSON
    pub random_content: Option<String>,
    /// JSON object of literal find → replace pairs
    pub replaces: String,
    pub js_cache: bool,
    pub script_convert: bool,
    pub cache_enabled: bool,
    pub cache_ttl_minutes: i64,
    pub created_at: i64,
    pub link_up: bool,
    pub deleted: bool,
}

impl SiteRecord {
    /// A fresh unbound record mirroring `origin_url`
    pub fn new(origin_url: impl Into<String>) -> Self {
        Self {
            origin_url: origin_url.into(),
            cache_enabled: true,
            js_cache: true,
            cache_ttl_minutes: 60,
            created_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    pub fn is_bound(&self) -> bool {
        self.host.is_some()
    }
}

/// Non-empty optional descriptor text
pub(crate) fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// `{"list":[...]}` wrapper shared by every injection descriptor
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorList<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DateMacro {
    pub position: String,
    /// strftime pattern, or a reference-time layout such as `2006-01-02`
    pub date: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInjection {
    pub position: String,
    #[serde(default)]
    pub image: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HrefInjection {
    pub position: String,
    #[serde(default)]
    pub prefix: String,
    pub random_href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParagraphInjection {
    pub position: String,
    #[serde(default)]
    pub random_content: Vec<String>,
}

pub type DateMacros = DescriptorList<DateMacro>;
pub type ImageInjections = DescriptorList<ImageInjection>;
pub type HrefInjections = DescriptorList<HrefInjection>;
pub type ParagraphInjections = DescriptorList<ParagraphInjection>;

/// Title and meta values for a page
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Inner page overrides: one set for every page, or one per request path
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ContentTitle {
    Flat(PageMeta),
    PerPath(HashMap<String, PageMeta>),
}

impl ContentTitle {
    pub fn for_path(&self, path: &str) -> Option<&PageMeta> {
        match self {
            ContentTitle::Flat(meta) => Some(meta),
            ContentTitle::PerPath(map) => map.get(path),
        }
    }
}
