//! Mirrorgate - a hostname-binding mirror proxy
//!
//! This library provides a reverse proxy that:
//! - Binds each new mirror hostname to the next pending site record
//! - Fetches pages from the site's origin and rewrites hosts and links
//! - Enriches HTML with titles, meta tags, friend links and injected content
//! - Caches transformed pages on disk with a per-site TTL
//! - Shows a neutral page to selected visitors and turns away unwanted crawlers

pub mod admin;
pub mod cache;
pub mod classify;
pub mod cloak;
pub mod codec;
pub mod config;
pub mod convert;
pub mod dom;
pub mod error;
pub mod html;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod site;
pub mod store;
pub mod upstream;
