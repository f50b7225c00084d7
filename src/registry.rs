//! Site registry: maps mirror hostnames to site records and binds new
//! hostnames to pending records on first contact.

use crate::site::SiteRecord;
use crate::store::SiteStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no pending site left to bind {host}")]
    BindingExhausted { host: String },
    #[error("site store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Bound/unbound counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub bound: usize,
    pub unbound: usize,
}

#[derive(Default)]
struct RegistryState {
    bound: HashMap<String, SiteRecord>,
    unbound: VecDeque<SiteRecord>,
}

impl RegistryState {
    fn from_records(records: Vec<SiteRecord>) -> Self {
        let mut state = Self::default();
        for mut site in records {
            match site.host.as_deref().map(normalize_host).filter(|h| !h.is_empty()) {
                Some(host) => {
                    site.host = Some(host.clone());
                    if let Some(previous) = state.bound.insert(host.clone(), site) {
                        warn!(host = %host, site_id = previous.id, "Duplicate host binding, keeping the later record");
                    }
                }
                None => {
                    site.host = None;
                    state.unbound.push_back(site);
                }
            }
        }
        state
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            bound: self.bound.len(),
            unbound: self.unbound.len(),
        }
    }
}

/// Owns the bound map and the pending queue behind one lock
pub struct SiteRegistry {
    store: Arc<dyn SiteStore>,
    state: Mutex<RegistryState>,
}

impl SiteRegistry {
    /// Build a registry and load every non-deleted record from the store
    pub fn load(store: Arc<dyn SiteStore>) -> Result<Self, RegistryError> {
        let registry = Self::new(store);
        registry.refresh()?;
        Ok(registry)
    }

    /// Build an empty registry; call [`refresh`](Self::refresh) to populate it
    pub fn new(store: Arc<dyn SiteStore>) -> Self {
        Self {
            store,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Site serving `host`, binding a pending record if the host is new
    pub fn resolve(&self, host: &str) -> Result<SiteRecord, RegistryError> {
        let host = normalize_host(host);
        let mut state = self.state.lock();

        if let Some(site) = state.bound.get(&host) {
            return Ok(site.clone());
        }

        let mut site = state
            .unbound
            .pop_front()
            .ok_or_else(|| RegistryError::BindingExhausted { host: host.clone() })?;

        // another process may have bound this host since the last refresh
        match self.store.get_one(&host) {
            Ok(Some(existing)) => {
                state.unbound.push_front(site);
                debug!(host = %host, site_id = existing.id, "Host already bound in store");
                state.bound.insert(host, existing.clone());
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => {
                state.unbound.push_front(site);
                return Err(RegistryError::Store(e));
            }
        }

        if let Err(e) = self.store.update_host_binding(site.id, &host) {
            state.unbound.push_front(site);
            return Err(RegistryError::Store(e));
        }

        site.host = Some(host.clone());
        state.bound.insert(host.clone(), site.clone());
        info!(
            host = %host,
            site_id = site.id,
            origin = %site.origin_url,
            pending = state.unbound.len(),
            "Bound host to site"
        );
        Ok(site)
    }

    /// Reload bound and pending records from the store
    pub fn refresh(&self) -> Result<RegistryStats, RegistryError> {
        let mut state = self.state.lock();
        let records = self.store.get_all(true)?;
        *state = RegistryState::from_records(records);
        let stats = state.stats();
        debug!(bound = stats.bound, unbound = stats.unbound, "Site registry refreshed");
        Ok(stats)
    }

    /// Persist a rewritten friend-link block, then reload
    pub fn record_friend_link(&self, id: i64, value: &str) -> Result<(), RegistryError> {
        self.store.update_friend_link(id, value)?;
        self.refresh()?;
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        self.state.lock().stats()
    }
}

/// Lowercased hostname without port or surrounding whitespace
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal, keep the brackets
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}
