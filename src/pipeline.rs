//! Content transform pipeline for origin responses
//!
//! Bodies are fully buffered: decompress, normalize to UTF-8, rewrite, then
//! re-encode with the origin's content-encoding. Rewritten text is written to
//! the cache in identity encoding.

use crate::cache::CacheStore;
use crate::classify::{self, ContentKind};
use crate::codec::{self, ContentEncoding};
use crate::convert::ScriptConverter;
use crate::html::{self, PageContext};
use crate::rewrite::{self, RewriteOptions};
use crate::site::SiteRecord;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bodies shorter than this are passed through untouched
pub const MIN_TRANSFORM_LEN: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to decode {encoding:?} response body: {source}")]
    Decode {
        encoding: ContentEncoding,
        source: io::Error,
    },
    #[error("failed to encode {encoding:?} response body: {source}")]
    Encode {
        encoding: ContentEncoding,
        source: io::Error,
    },
}

/// Everything the pipeline needs to know about the request that produced a response
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub site: SiteRecord,
    /// Mirror hostname (normalized, no port)
    pub host: String,
    /// Mirror authority as seen by the client (may carry a port)
    pub authority: String,
    /// Request path
    pub path: String,
    /// Authority of the site's origin; links to it are re-pointed at the mirror
    pub origin_authority: String,
    /// Response came through the `proxy_url` / `X-Proxy-Target` tunnel
    pub tunnel: bool,
}

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// Body in the origin's content-encoding
    pub body: Vec<u8>,
    /// Replacement `Content-Type`, when the body was re-encoded as UTF-8
    pub content_type: Option<String>,
    /// Friend-link block to persist for the site
    pub friend_link_update: Option<String>,
    /// Whether the body went through decode/rewrite/encode
    pub rewritten: bool,
    pub cached: bool,
}

impl Transformed {
    fn passthrough(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: None,
            friend_link_update: None,
            rewritten: false,
            cached: false,
        }
    }
}

pub struct Pipeline {
    cache: CacheStore,
    converter: Arc<dyn ScriptConverter>,
    use_tls: bool,
    allow_external: bool,
    external_ignores: Vec<String>,
}

impl Pipeline {
    pub fn new(
        cache: CacheStore,
        converter: Arc<dyn ScriptConverter>,
        use_tls: bool,
        allow_external: bool,
        external_ignores: Vec<String>,
    ) -> Self {
        Self {
            cache,
            converter,
            use_tls,
            allow_external,
            external_ignores,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Options for rewriting URLs from `origin_authority` into `mirror_authority`
    pub fn rewrite_options<'a>(
        &'a self,
        origin_authority: &'a str,
        mirror_authority: &'a str,
    ) -> RewriteOptions<'a> {
        RewriteOptions {
            old_host: origin_authority,
            new_host: mirror_authority,
            use_tls: self.use_tls,
            allow_external: self.allow_external,
            ignore: &self.external_ignores,
        }
    }

    /// Transform an origin response body for the mirror
    pub fn transform(
        &self,
        ctx: &TransformContext,
        response: OriginResponse,
    ) -> Result<Transformed, PipelineError> {
        if response.body.len() < MIN_TRANSFORM_LEN || response.status == 404 {
            return Ok(Transformed::passthrough(response.body));
        }

        let content_type = response.content_type.as_deref().unwrap_or("");
        let image_path = ctx.path.trim_end_matches('/');
        if classify::is_image_path(image_path) {
            let mut cached = false;
            if self.cache.saves_images() && !ctx.tunnel {
                match self.cache.store_image(&ctx.host, image_path, &response.body) {
                    Ok(_) => cached = true,
                    Err(e) => warn!(host = %ctx.host, path = %ctx.path, error = %e, "Failed to save image"),
                }
            }
            let mut out = Transformed::passthrough(response.body);
            out.cached = cached;
            return Ok(out);
        }

        let kind = ContentKind::from_content_type(content_type);
        if !kind.is_textual() {
            return Ok(Transformed::passthrough(response.body));
        }

        let encoding = ContentEncoding::from_header(response.content_encoding.as_deref());
        let decoded = encoding
            .decode(&response.body)
            .map_err(|source| PipelineError::Decode { encoding, source })?;
        let text = codec::to_utf8(&decoded, content_type);

        let mut friend_link_update = None;
        let rewritten = match kind {
            ContentKind::Html => {
                let opts = self.rewrite_options(&ctx.origin_authority, &ctx.authority);
                let hosted = rewrite::rewrite_hosts(&text, &opts);
                let page = PageContext {
                    site: &ctx.site,
                    host: &ctx.host,
                    path: &ctx.path,
                    now: chrono::Local::now().fixed_offset(),
                };
                let out = html::rewrite_page(&hosted, &page, self.converter.as_ref());
                friend_link_update = out.friend_link_update;
                out.html
            }
            ContentKind::Xml => {
                let opts = self.rewrite_options(&ctx.origin_authority, &ctx.authority);
                rewrite::rewrite_hosts(&text, &opts)
            }
            _ => text,
        };

        let plain = rewritten.into_bytes();
        let body = encoding
            .encode(&plain)
            .map_err(|source| PipelineError::Encode { encoding, source })?;

        let cached = self.maybe_cache(ctx, response.status, content_type, &plain);

        debug!(
            host = %ctx.host,
            path = %ctx.path,
            ?kind,
            ?encoding,
            bytes = body.len(),
            cached,
            "Transformed origin response"
        );

        Ok(Transformed {
            body,
            content_type: Some(codec::utf8_content_type(content_type)),
            friend_link_update,
            rewritten: true,
            cached,
        })
    }

    fn maybe_cache(&self, ctx: &TransformContext, status: u16, content_type: &str, body: &[u8]) -> bool {
        if ctx.tunnel || !(200..300).contains(&status) {
            return false;
        }
        if classify::is_javascript(content_type) && !ctx.site.js_cache {
            return false;
        }

        match self.cache.store(&ctx.host, &ctx.path, body) {
            Ok(_) => true,
            Err(e) => {
                warn!(host = %ctx.host, path = %ctx.path, error = %e, "Failed to write cache entry");
                false
            }
        }
    }
}
