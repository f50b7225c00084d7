use crate::admin::{self, Route, Routes};
use crate::cache::{CacheError, CacheLookup, CacheStore, CachedEntry};
use crate::cloak::CloakPolicy;
use crate::codec::ContentEncoding;
use crate::config::Config;
use crate::convert::ScriptConverter;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pipeline::{OriginResponse, Pipeline, TransformContext};
use crate::registry::{RegistryError, SiteRegistry};
use crate::rewrite::{self, RewriteOptions};
use crate::upstream::{ClientConfig, OriginClient, OriginRequest};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, HOST, LOCATION, ORIGIN, SET_COOKIE, USER_AGENT,
};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
/// Tunnel header: replaces scheme and authority of the origin request
const X_PROXY_TARGET: &str = "x-proxy-target";
const X_ORIGIN_HOST: &str = "x-origin-host";
const X_PROXY_CLIENT: &str = "x-proxy-client";
const X_MIRROR_CACHE: &str = "x-mirror-cache";


const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const BUILTIN_NOT_FOUND_PAGE: &str = "<!DOCTYPE html>
<html>
<head><meta charset=\"utf-8\"><title>404 Not Found</title></head>
<body>
<h1>404 Not Found</h1>
<p>The page you are looking for could not be found.</p>
</body>
</html>
";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Everything a request handler needs, shared across connections
pub struct MirrorState {
    registry: Arc<SiteRegistry>,
    cloak: CloakPolicy,
    pipeline: Arc<Pipeline>,
    client: OriginClient,
    routes: Routes,
    not_found_page: Bytes,
    use_tls: bool,
}

impl MirrorState {
    pub fn new(
        config: &Config,
        registry: Arc<SiteRegistry>,
        spider_ips: Vec<String>,
        converter: Arc<dyn ScriptConverter>,
    ) -> anyhow::Result<Self> {
        let cache = CacheStore::new(&config.cache.root, config.cache.save_images);
        let pipeline = Pipeline::new(
            cache,
            converter,
            config.server.tls,
            config.upstream.allow_external,
            config.upstream.external_ignores.clone(),
        );
        let client = OriginClient::new(ClientConfig::from(&config.upstream))?;

        Ok(Self {
            registry,
            cloak: CloakPolicy::new(&config.cloak, &config.crawlers, spider_ips),
            pipeline: Arc::new(pipeline),
            client,
            routes: Routes::from_config(&config.server),
            not_found_page: load_not_found_page(config.server.not_found_page.as_deref()),
            use_tls: config.server.tls,
        })
    }

}

fn load_not_found_page(path: Option<&str>) -> Bytes {
    match path {
        Some(path) => match std::fs::read(path) {
            Ok(page) => Bytes::from(page),
            Err(e) => {
                warn!(path, error = %e, "Failed to read not-found page, using built-in page");
                Bytes::from_static(BUILTIN_NOT_FOUND_PAGE.as_bytes())
            }
        },
        None => Bytes::from_static(BUILTIN_NOT_FOUND_PAGE.as_bytes()),
    }
}

/// The mirror server
pub struct MirrorServer {
    bind_addr: SocketAddr,
    state: Arc<MirrorState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MirrorServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<MirrorState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, tls_links = self.state.use_tls, "Mirror server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Mirror server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, state: Arc<MirrorState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<MirrorState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let mut response = match state.routes.route(req.method(), &path) {
        Route::Image => admin::serve_image(state.routes.image_root(), &path).await,
        Route::Status => admin::status(Arc::clone(&state.registry), state.client.stats()).await,
        Route::Mirror => mirror(req, &state, client_addr, &request_id).await,
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn mirror(
    req: Request<Incoming>,
    state: &MirrorState,
    client_addr: SocketAddr,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (hostname, authority) = match extract_host(&req) {
        Some(host) => host,
        None => {
            return json_error_response(ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header");
        }
    };

    let path = req.uri().path().to_string();
    let user_agent = header_str(req.headers(), USER_AGENT.as_str()).unwrap_or("").to_string();
    let client_ip = client_ip(req.headers(), client_addr);

    debug!(hostname, method = %req.method(), uri = %req.uri(), client_ip, request_id, "Incoming request");

    let registry = Arc::clone(&state.registry);
    let lookup_host = hostname.clone();
    let site = match tokio::task::spawn_blocking(move || registry.resolve(&lookup_host)).await {
        Ok(Ok(site)) => site,
        Ok(Err(e @ RegistryError::BindingExhausted { .. })) => {
            warn!(hostname, error = %e, "Site not provisioned");
            return json_error_response(ProxyErrorCode::SiteNotProvisioned, "Site not provisioned");
        }
        Ok(Err(e)) => {
            error!(hostname, error = %e, "Site lookup failed");
            return json_error_response(ProxyErrorCode::SiteNotProvisioned, "Site not provisioned");
        }
        Err(e) => {
            error!(hostname, error = %e, "Site lookup task failed");
            return json_error_response(ProxyErrorCode::InternalError, "Internal error");
        }
    };

    if state.cloak.should_cloak(&user_agent, &path, &hostname, &client_ip) {
        debug!(hostname, path, client_ip, "Serving cloak page");
        return cloak_page(state.not_found_page.clone());
    }

    if state.cloak.is_rejected_crawler(&user_agent) {
        debug!(hostname, path, user_agent, "Rejected crawler");
        return json_error_response(ProxyErrorCode::NotFound, "Not found");
    }

    if !site.cache_enabled || req.method() != Method::GET {
        return json_error_response(ProxyErrorCode::Forbidden, "Forbidden");
    }

    let query = req.uri().query().map(str::to_string);
    let tunnel_url = query.as_deref().and_then(rewrite::tunnel_target);
    let proxy_target = header_str(req.headers(), X_PROXY_TARGET).map(str::to_string);

    if tunnel_url.is_none() && proxy_target.is_none() {
        if let Some(response) = serve_from_cache(state, &hostname, &path, site.cache_ttl_minutes).await {
            return response;
        }
    }

    let target = match OriginTarget::resolve(
        &site.origin_url,
        &path,
        query.as_deref(),
        tunnel_url.as_deref(),
        proxy_target.as_deref(),
        state.use_tls,
    ) {
        Ok(target) => target,
        Err(e) => {
            error!(hostname, site_id = site.id, error = %e, "Invalid origin target");
            return json_error_response(ProxyErrorCode::OriginFetchFailed, e);
        }
    };

    let request = OriginRequest {
        method: Method::GET,
        url: target.url.clone(),
        headers: origin_request_headers(req.headers(), &target, &hostname, &client_ip),
        body: Bytes::new(),
    };

    let reply = match state.client.fetch(request).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(hostname, url = %target.url, error = %e, "Origin fetch failed");
            return json_error_response(ProxyErrorCode::OriginFetchFailed, e.to_string());
        }
    };

    let opts = state.pipeline.rewrite_options(&target.site_authority, &authority);
    let mut headers = mirror_response_headers(&reply.headers, &target, &hostname, &opts, state.use_tls);
    let status = if reply.status == StatusCode::MOVED_PERMANENTLY {
        StatusCode::FOUND
    } else {
        reply.status
    };

    let site_id = site.id;
    let ctx = TransformContext {
        site,
        host: hostname.clone(),
        authority: authority.clone(),
        path: path.clone(),
        origin_authority: target.site_authority.clone(),
        tunnel: target.tunnel,
    };
    let origin = OriginResponse {
        status: reply.status.as_u16(),
        content_type: header_str(&reply.headers, CONTENT_TYPE.as_str()).map(str::to_string),
        content_encoding: header_str(&reply.headers, CONTENT_ENCODING.as_str()).map(str::to_string),
        body: reply.body.to_vec(),
    };

    let pipeline = Arc::clone(&state.pipeline);
    let transformed = match tokio::task::spawn_blocking(move || pipeline.transform(&ctx, origin)).await {
        Ok(Ok(transformed)) => transformed,
        Ok(Err(e)) => {
            error!(hostname, path, error = %e, "Failed to transform origin response");
            return json_error_response(ProxyErrorCode::OriginFetchFailed, e.to_string());
        }
        Err(e) => {
            error!(hostname, path, error = %e, "Transform task failed");
            return json_error_response(ProxyErrorCode::InternalError, "Internal error");
        }
    };

    if let Some(friend_link) = transformed.friend_link_update {
        let registry = Arc::clone(&state.registry);
        match tokio::task::spawn_blocking(move || registry.record_friend_link(site_id, &friend_link)).await {
            Ok(Ok(())) => info!(hostname, site_id, "Friend links updated"),
            Ok(Err(e)) => warn!(hostname, site_id, error = %e, "Failed to persist friend links"),
            Err(e) => warn!(hostname, site_id, error = %e, "Friend link task failed"),
        }
    }

    if let Some(content_type) = transformed.content_type {
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    headers.insert(
        HeaderName::from_static(X_MIRROR_CACHE),
        HeaderValue::from_static(if transformed.cached { "STORE" } else { "MISS" }),
    );

    debug!(
        hostname,
        path,
        status = status.as_u16(),
        rewritten = transformed.rewritten,
        cached = transformed.cached,
        bytes = transformed.body.len(),
        "Mirrored response"
    );

    let mut response = Response::new(Full::new(Bytes::from(transformed.body)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Look up a fresh cache entry; `None` means fetch from origin
async fn serve_from_cache(
    state: &MirrorState,
    host: &str,
    path: &str,
    ttl_minutes: i64,
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    let cache = state.pipeline.cache().clone();
    let (host, path) = (host.to_string(), path.to_string());
    let lookup_host = host.clone();
    let lookup_path = path.clone();

    let result = tokio::task::spawn_blocking(move || {
        cache.lookup(&lookup_host, &lookup_path, ttl_minutes, SystemTime::now())
    })
    .await;

    match result {
        Ok(result) => cache_outcome(&host, &path, result),
        Err(e) => {
            error!(hostname = %host, path = %path, error = %e, "Cache lookup task failed");
            Some(json_error_response(ProxyErrorCode::InternalError, "Internal error"))
        }
    }
}

/// Response for a finished cache lookup; `None` on a miss
fn cache_outcome(
    host: &str,
    path: &str,
    result: Result<CacheLookup, CacheError>,
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    match result {
        Ok(CacheLookup::Hit(entry)) => {
            debug!(hostname = host, path, file = %entry.path.display(), "Cache hit");
            Some(cached_response(entry))
        }
        Ok(CacheLookup::Miss(reason)) => {
            debug!(hostname = host, path, ?reason, "Cache miss");
            None
        }
        Err(e @ CacheError::Stat { .. }) => {
            error!(hostname = host, path, error = %e, "Cache unavailable");
            Some(json_error_response(ProxyErrorCode::CacheUnavailable, "Cache unavailable"))
        }
        Err(e) => {
            error!(hostname = host, path, error = %e, "Failed to read cache entry");
            Some(json_error_response(ProxyErrorCode::InternalError, e.to_string()))
        }
    }
}

fn cached_response(entry: CachedEntry) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, entry.content_type)
        .header(X_MIRROR_CACHE, "HIT")
        .body(Full::new(Bytes::from(entry.body)).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

fn cloak_page(page: Bytes) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-cache")
        .body(Full::new(page).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Hostname (lowercased, no port) and authority (with port) of the request
fn extract_host<B>(req: &Request<B>) -> Option<(String, String)> {
    let raw = header_str(req.headers(), HOST.as_str())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;

    let (hostname, port) = match raw.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => (host, Some(port)),
        _ => (raw.as_str(), None),
    };

    // Validate length (DNS max is 253 characters)
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Validate characters: alphanumeric, hyphen, and dot only
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    let hostname = hostname.to_ascii_lowercase();
    let authority = match port {
        Some(port) => format!("{}:{}", hostname, port),
        None => hostname.clone(),
    };
    Some((hostname, authority))
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    header_str(headers, X_FORWARDED_FOR)
        .and_then(|v| v.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        .or_else(|| header_str(headers, X_REAL_IP))
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Where an origin request goes
#[derive(Debug, Clone, PartialEq)]
struct OriginTarget {
    scheme: String,
    authority: String,
    url: String,
    /// Authority of the site's configured origin
    site_authority: String,
    /// Target came from `proxy_url` or `X-Proxy-Target`
    tunnel: bool,
}

impl OriginTarget {
    fn resolve(
        origin_url: &str,
        path: &str,
        query: Option<&str>,
        tunnel_url: Option<&str>,
        proxy_target: Option<&str>,
        use_tls: bool,
    ) -> Result<Self, String> {
        let default_scheme = if use_tls { "https" } else { "http" };
        let origin = parse_url(origin_url, default_scheme)?;
        let site_authority =
            authority_of(&origin).ok_or_else(|| format!("origin url {} has no host", origin_url))?;

        if let Some(raw) = tunnel_url {
            let url = parse_url(raw, default_scheme)?;
            let authority = authority_of(&url).ok_or_else(|| format!("tunnel url {} has no host", raw))?;
            return Ok(Self {
                scheme: url.scheme().to_string(),
                authority,
                url: url.to_string(),
                site_authority,
                tunnel: true,
            });
        }

        let mut scheme = origin.scheme().to_string();
        let mut authority = site_authority.clone();
        let mut tunnel = false;

        if let Some(raw) = proxy_target.map(str::trim).filter(|v| !v.is_empty()) {
            let (target_scheme, rest) = match raw.split_once("://") {
                Some((s, rest)) => (Some(s), rest),
                None => (None, raw.trim_start_matches("//")),
            };
            let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
            if !host.is_empty() {
                authority = host.to_ascii_lowercase();
                if let Some(s) = target_scheme {
                    scheme = s.to_ascii_lowercase();
                }
                tunnel = true;
            }
        }

        let prefix = origin.path().trim_end_matches('/');
        let mut url = format!("{}://{}{}{}", scheme, authority, prefix, path);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }

        Ok(Self {
            scheme,
            authority,
            url,
            site_authority,
            tunnel,
        })
    }
}

fn parse_url(raw: &str, default_scheme: &str) -> Result<Url, String> {
    let raw = raw.trim();
    let candidate = if raw.starts_with("//") {
        format!("{}:{}", default_scheme, raw)
    } else if !raw.contains("://") {
        format!("{}://{}", default_scheme, raw)
    } else {
        raw.to_string()
    };
    Url::parse(&candidate).map_err(|e| format!("invalid url {}: {}", raw, e))
}

fn authority_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// Headers for the outbound request
fn origin_request_headers(incoming: &HeaderMap, target: &OriginTarget, mirror_host: &str, client_ip: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || name == HOST
            || name == CONTENT_LENGTH
            || name == ACCEPT_ENCODING
            || lower == X_PROXY_TARGET
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&target.authority) {
        headers.insert(HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{}://{}", target.scheme, target.authority)) {
        headers.insert(ORIGIN, value);
    }
    if let Ok(value) = HeaderValue::from_str(mirror_host) {
        headers.insert(X_ORIGIN_HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert(X_REAL_IP, value);
    }
    headers.insert(ACCEPT_ENCODING, origin_accept_encoding(incoming));
    headers
}

/// Codings from the client's `Accept-Encoding` the pipeline can decode and re-encode.
///
/// The origin's encoding is passed back to the client, so only codings the client
/// accepted are offered; with none left the origin is asked for identity.
fn origin_accept_encoding(incoming: &HeaderMap) -> HeaderValue {
    let mut codings: Vec<&'static str> = Vec::new();
    let mut offer = |encoding: ContentEncoding| {
        if let Some(name) = encoding.header_value() {
            if !codings.contains(&name) {
                codings.push(name);
            }
        }
    };

    for value in incoming.get_all(ACCEPT_ENCODING) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for item in value.split(',') {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or("").trim();
            let refused = params.any(|p| {
                p.trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if coding.is_empty() || refused {
                continue;
            }
            if coding == "*" {
                offer(ContentEncoding::Gzip);
                offer(ContentEncoding::Deflate);
                offer(ContentEncoding::Brotli);
            } else {
                offer(ContentEncoding::from_header(Some(coding)));
            }
        }
    }

    if codings.is_empty() {
        HeaderValue::from_static("identity")
    } else {
        HeaderValue::from_str(&codings.join(", ")).unwrap_or_else(|_| HeaderValue::from_static("identity"))
    }
}

/// Origin response headers as sent to the client
fn mirror_response_headers(
    origin: &HeaderMap,
    target: &OriginTarget,
    mirror_host: &str,
    opts: &RewriteOptions<'_>,
    use_tls: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in origin {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || name == CONTENT_LENGTH
            || name == CACHE_CONTROL
            || lower == "content-security-policy"
            || lower == "expect-ct"
            || (!use_tls && lower == "strict-transport-security")
        {
            continue;
        }

        if name == SET_COOKIE {
            if let Some(cookie) = value.to_str().ok().map(|v| rewrite_set_cookie(v, mirror_host, use_tls)) {
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    headers.append(SET_COOKIE, value);
                }
            }
            continue;
        }

        if name == LOCATION {
            if let Some(location) = value.to_str().ok().map(|v| rewrite_location(v, target, opts)) {
                if let Ok(value) = HeaderValue::from_str(&location) {
                    headers.insert(LOCATION, value);
                }
            }
            continue;
        }

        headers.append(name.clone(), value.clone());
    }

    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(X_PROXY_CLIENT, HeaderValue::from_static("Forward-Cli"));
    headers
}

/// Point a cookie at the mirror host; drop `Secure` when the mirror is plain http
fn rewrite_set_cookie(cookie: &str, mirror_host: &str, use_tls: bool) -> String {
    let mut parts = Vec::new();
    let mut has_domain = false;

    for (i, part) in cookie.split(';').enumerate() {
        let part = part.trim();
        if i == 0 {
            parts.push(part.to_string());
            continue;
        }
        let key = part.split('=').next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("domain") {
            parts.push(format!("Domain={}", mirror_host));
            has_domain = true;
        } else if part.is_empty() || (!use_tls && key.eq_ignore_ascii_case("secure")) {
            continue;
        } else {
            parts.push(part.to_string());
        }
    }

    if !has_domain {
        parts.push(format!("Domain={}", mirror_host));
    }
    parts.join("; ")
}

/// Absolute locations go through the host rewriter; relative ones on tunnel
/// responses are resolved against the tunnel target first
fn rewrite_location(location: &str, target: &OriginTarget, opts: &RewriteOptions<'_>) -> String {
    let lower = location.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || location.starts_with("//") {
        return rewrite::rewrite_hosts(location, opts);
    }
    if !target.tunnel {
        return location.to_string();
    }

    match Url::parse(&target.url).and_then(|base| base.join(location)) {
        Ok(absolute) => rewrite::rewrite_hosts(absolute.as_str(), opts),
        Err(_) => location.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts<'a>(ignore: &'a [String]) -> RewriteOptions<'a> {
        RewriteOptions {
            old_host: "origin.com",
            new_host: "mirror.net",
            use_tls: false,
            allow_external: true,
            ignore,
        }
    }

    fn plain_target() -> OriginTarget {
        OriginTarget::resolve("https://origin.com", "/a.html", None, None, None, false).unwrap()
    }

    #[test]
    fn test_extract_host() {
        let req = Request::builder()
            .uri("/")
            .header("Host", "A.Mirror.NET:8080")
            .body(())
            .unwrap();
        assert_eq!(
            extract_host(&req),
            Some(("a.mirror.net".to_string(), "a.mirror.net:8080".to_string()))
        );

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(extract_host(&req), None);

        let req = Request::builder()
            .uri("/")
            .header("Host", "evil host.com")
            .body(())
            .unwrap();
        assert_eq!(extract_host(&req), None);
    }

    #[test]
    fn test_client_ip_precedence() {
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, addr), "10.0.0.1");

        headers.insert(X_REAL_IP, HeaderValue::from_static("2.2.2.2"));
        assert_eq!(client_ip(&headers, addr), "2.2.2.2");

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1, 3.3.3.3"));
        assert_eq!(client_ip(&headers, addr), "1.1.1.1");
    }

    #[test]
    fn test_target_joins_origin_prefix() {
        let target =
            OriginTarget::resolve("https://origin.com/sub/", "/news/1.html", Some("p=2"), None, None, false).unwrap();
        assert_eq!(target.url, "https://origin.com/sub/news/1.html?p=2");
        assert_eq!(target.authority, "origin.com");
        assert_eq!(target.site_authority, "origin.com");
        assert!(!target.tunnel);

        let target = OriginTarget::resolve("origin.com:8443", "/", None, None, None, true).unwrap();
        assert_eq!(target.url, "https://origin.com:8443/");
        assert_eq!(target.authority, "origin.com:8443");
    }

    #[test]
    fn test_tunnel_param_replaces_whole_url() {
        let target = OriginTarget::resolve(
            "https://origin.com",
            "/",
            Some("proxy_url=https%3A%2F%2Fcdn.other.com%2Fa.css"),
            Some("https://cdn.other.com/a.css"),
            None,
            false,
        )
        .unwrap();
        assert_eq!(target.url, "https://cdn.other.com/a.css");
        assert_eq!(target.authority, "cdn.other.com");
        assert_eq!(target.site_authority, "origin.com");
        assert!(target.tunnel);

        let target = OriginTarget::resolve("https://origin.com", "/", None, Some("//cdn.other.com/x"), None, true).unwrap();
        assert_eq!(target.url, "https://cdn.other.com/x");
    }

    #[test]
    fn test_proxy_target_header_replaces_authority() {
        let target = OriginTarget::resolve(
            "https://origin.com/sub",
            "/a.js",
            None,
            None,
            Some("http://static.other.com"),
            false,
        )
        .unwrap();
        assert_eq!(target.url, "http://static.other.com/sub/a.js");
        assert!(target.tunnel);

        let target =
            OriginTarget::resolve("https://origin.com", "/a.js", None, None, Some("static.other.com"), false).unwrap();
        assert_eq!(target.url, "https://static.other.com/a.js");
    }

    #[test]
    fn test_origin_request_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert(HOST, HeaderValue::from_static("mirror.net"));
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert(ACCEPT_ENCODING, HeaderValue::from_static("zstd"));
        incoming.insert(X_PROXY_TARGET, HeaderValue::from_static("other.com"));
        incoming.insert(USER_AGENT, HeaderValue::from_static("Baiduspider"));

        let headers = origin_request_headers(&incoming, &plain_target(), "mirror.net", "1.2.3.4");
        assert_eq!(headers.get(HOST).unwrap(), "origin.com");
        assert_eq!(headers.get(ORIGIN).unwrap(), "https://origin.com");
        assert_eq!(headers.get(X_ORIGIN_HOST).unwrap(), "mirror.net");
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "1.2.3.4");
        assert_eq!(headers.get(ACCEPT_ENCODING).unwrap(), "identity");
        assert_eq!(headers.get(USER_AGENT).unwrap(), "Baiduspider");
        assert!(headers.get("connection").is_none());
        assert!(headers.get(X_PROXY_TARGET).is_none());
    }

    #[test]
    fn test_origin_accept_encoding_follows_client() {
        let accept = |value: Option<&'static str>| {
            let mut incoming = HeaderMap::new();
            if let Some(value) = value {
                incoming.insert(ACCEPT_ENCODING, HeaderValue::from_static(value));
            }
            origin_accept_encoding(&incoming)
        };

        assert_eq!(accept(None), "identity");
        assert_eq!(accept(Some("identity")), "identity");
        assert_eq!(accept(Some("gzip")), "gzip");
        assert_eq!(accept(Some("gzip, deflate, br, zstd")), "gzip, deflate, br");
        assert_eq!(accept(Some("br;q=1.0, gzip;q=0")), "br");
        assert_eq!(accept(Some("x-gzip, gzip")), "gzip");
        assert_eq!(accept(Some("*")), "gzip, deflate, br");
    }

    #[test]
    fn test_response_header_hygiene() {
        let mut origin = HeaderMap::new();
        origin.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
        origin.insert("expect-ct", HeaderValue::from_static("max-age=0"));
        origin.insert("strict-transport-security", HeaderValue::from_static("max-age=600"));
        origin.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=3600"));
        origin.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        origin.insert("x-custom", HeaderValue::from_static("kept"));
        origin.insert(LOCATION, HeaderValue::from_static("https://origin.com/next"));

        let headers = mirror_response_headers(&origin, &plain_target(), "mirror.net", &opts(&[]), false);
        assert!(headers.get("content-security-policy").is_none());
        assert!(headers.get("expect-ct").is_none());
        assert!(headers.get("strict-transport-security").is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(headers.get(X_PROXY_CLIENT).unwrap(), "Forward-Cli");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.get(LOCATION).unwrap(), "http://mirror.net/next");

        let headers = mirror_response_headers(&origin, &plain_target(), "mirror.net", &opts(&[]), true);
        assert!(headers.get("strict-transport-security").is_some());
    }

    #[test]
    fn test_rewrite_set_cookie() {
        assert_eq!(
            rewrite_set_cookie("sid=1; Domain=.origin.com; Path=/; Secure; HttpOnly", "mirror.net", false),
            "sid=1; Domain=mirror.net; Path=/; HttpOnly"
        );
        assert_eq!(
            rewrite_set_cookie("sid=1; Path=/; Secure", "mirror.net", true),
            "sid=1; Path=/; Secure; Domain=mirror.net"
        );
    }

    #[test]
    fn test_rewrite_location() {
        let o = opts(&[]);
        let target = plain_target();
        assert_eq!(rewrite_location("/login", &target, &o), "/login");
        assert_eq!(rewrite_location("http://origin.com/x", &target, &o), "http://mirror.net/x");

        let tunnel = OriginTarget::resolve(
            "https://origin.com",
            "/",
            None,
            Some("https://cdn.other.com/dir/a"),
            None,
            false,
        )
        .unwrap();
        assert_eq!(
            rewrite_location("/b", &tunnel, &o),
            "http://mirror.net/?proxy_url=https%3A%2F%2Fcdn.other.com%2Fb"
        );
    }

    #[test]
    fn test_not_found_page_fallback() {
        let page = load_not_found_page(Some("/definitely/missing/404.html"));
        assert_eq!(&page[..], BUILTIN_NOT_FOUND_PAGE.as_bytes());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("404.html");
        std::fs::write(&file, "<p>gone</p>").unwrap();
        let page = load_not_found_page(file.to_str());
        assert_eq!(&page[..], b"<p>gone</p>");
    }

    #[test]
    fn test_cache_stat_error_is_405() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the host directory should be makes every lookup fail to stat
        std::fs::write(dir.path().join("a.mirror.net"), b"").unwrap();
        let cache = CacheStore::new(dir.path(), false);

        let result = cache.lookup("a.mirror.net", "/news/1.html", 5, SystemTime::now());
        assert!(matches!(result, Err(CacheError::Stat { .. })));

        let response = cache_outcome("a.mirror.net", "/news/1.html", result).unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CACHE_UNAVAILABLE");
    }

    #[test]
    fn test_cache_read_error_is_500() {
        let result = Err(CacheError::Read {
            path: "/cache/a.mirror.net/index.html.cache".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        let response = cache_outcome("a.mirror.net", "/", result).unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_cache_miss_falls_through_and_hit_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path(), false);

        let miss = cache.lookup("a.mirror.net", "/feed.csv", 5, SystemTime::now());
        assert!(cache_outcome("a.mirror.net", "/feed.csv", miss).is_none());

        cache.store("a.mirror.net", "/feed.csv", b"a,b\n").unwrap();
        let hit = cache.lookup("a.mirror.net", "/feed.csv", 5, SystemTime::now());
        let response = cache_outcome("a.mirror.net", "/feed.csv", hit).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/csv; charset=utf-8");
        assert_eq!(response.headers().get(X_MIRROR_CACHE).unwrap(), "HIT");
    }
}
