//! SQLite storage for site records
//!
//! Records are created by external tooling; the mirror only reads them, binds
//! hostnames and rewrites friend links.

use crate::site::SiteRecord;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = "id, domain, org_url, web_title, web_seo_title, web_keywords,
    web_description, content_title, web_friend_link, web_date, web_image, web_random_href,
    web_random_content, web_replaces, web_js, web_s2t, web_cache_enable, web_cache_time,
    c_time, linkup, isdel";

/// Persistence seam used by the site registry
pub trait SiteStore: Send + Sync {
    /// All records, optionally skipping soft-deleted ones
    fn get_all(&self, exclude_deleted: bool) -> Result<Vec<SiteRecord>>;

    /// Record bound to `host`, if any
    fn get_one(&self, host: &str) -> Result<Option<SiteRecord>>;

    /// Persist the hostname assigned to record `id`
    fn update_host_binding(&self, id: i64, host: &str) -> Result<()>;

    /// Persist a rewritten friend-link block and mark the record as linked up
    fn update_friend_link(&self, id: i64, value: &str) -> Result<()>;
}

/// Site store backed by a single `website_config` table
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open site database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Site database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: site table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: website_config");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS website_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT UNIQUE,
                org_url TEXT NOT NULL,
                web_title TEXT NOT NULL DEFAULT '',
                web_seo_title TEXT NOT NULL DEFAULT '',
                web_keywords TEXT NOT NULL DEFAULT '',
                web_description TEXT NOT NULL DEFAULT '',
                content_title TEXT,
                web_friend_link TEXT,
                web_date TEXT,
                web_image TEXT,
                web_random_href TEXT,
                web_random_content TEXT,
                web_replaces TEXT NOT NULL DEFAULT '',
                web_js INTEGER NOT NULL DEFAULT 1,
                web_s2t INTEGER NOT NULL DEFAULT 0,
                web_cache_enable INTEGER NOT NULL DEFAULT 1,
                web_cache_time INTEGER NOT NULL DEFAULT 60,
                c_time INTEGER NOT NULL,
                linkup INTEGER NOT NULL DEFAULT 0,
                isdel INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_website_config_isdel ON website_config(isdel);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Insert a record and return its id (provisioning tools and tests)
    pub fn insert(&self, site: &SiteRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO website_config (domain, org_url, web_title, web_seo_title, web_keywords,
                web_description, content_title, web_friend_link, web_date, web_image,
                web_random_href, web_random_content, web_replaces, web_js, web_s2t,
                web_cache_enable, web_cache_time, c_time, linkup, isdel)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                site.host,
                site.origin_url,
                site.title,
                site.seo_title,
                site.keywords,
                site.description,
                site.content_title,
                site.friend_link,
                site.date_macros,
                site.images,
                site.random_href,
                site.random_content,
                site.replaces,
                site.js_cache,
                site.script_convert,
                site.cache_enabled,
                site.cache_ttl_minutes,
                site.created_at,
                site.link_up,
                site.deleted,
            ],
        )
        .context("Failed to insert site")?;
        Ok(conn.last_insert_rowid())
    }

    /// Soft-delete a record
    pub fn mark_deleted(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("UPDATE website_config SET isdel = 1 WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Number of stored records, deleted ones included
    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM website_config", [], |row| row.get(0))
            .context("Failed to count sites")
    }
}

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<SiteRecord> {
    Ok(SiteRecord {
        id: row.get(0)?,
        host: row.get(1)?,
        origin_url: row.get(2)?,
        title: row.get(3)?,
        seo_title: row.get(4)?,
        keywords: row.get(5)?,
        description: row.get(6)?,
        content_title: row.get(7)?,
        friend_link: row.get(8)?,
        date_macros: row.get(9)?,
        images: row.get(10)?,
        random_href: row.get(11)?,
        random_content: row.get(12)?,
        replaces: row.get(13)?,
        js_cache: row.get(14)?,
        script_convert: row.get(15)?,
        cache_enabled: row.get(16)?,
        cache_ttl_minutes: row.get(17)?,
        created_at: row.get(18)?,
        link_up: row.get(19)?,
        deleted: row.get(20)?,
    })
}

impl SiteStore for SqliteStore {
    fn get_all(&self, exclude_deleted: bool) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock();
        let sql = if exclude_deleted {
            format!("SELECT {} FROM website_config WHERE isdel = 0 ORDER BY id", SELECT_COLUMNS)
        } else {
            format!("SELECT {} FROM website_config ORDER BY id", SELECT_COLUMNS)
        };

        let mut stmt = conn.prepare(&sql)?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load sites")?;
        Ok(sites)
    }

    fn get_one(&self, host: &str) -> Result<Option<SiteRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM website_config WHERE domain = ?1", SELECT_COLUMNS),
            params![host.trim()],
            site_from_row,
        )
        .optional()
        .context("Failed to get site")
    }

    fn update_host_binding(&self, id: i64, host: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE website_config SET domain = ?1 WHERE id = ?2",
                params![host, id],
            )
            .with_context(|| format!("Failed to bind {} to site {}", host, id))?;
        if changed == 0 {
            anyhow::bail!("site {} not found", id);
        }
        Ok(())
    }

    fn update_friend_link(&self, id: i64, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE website_config SET web_friend_link = ?1, linkup = 1 WHERE id = ?2",
                params![value, id],
            )
            .with_context(|| format!("Failed to update friend links of site {}", id))?;
        if changed == 0 {
            anyhow::bail!("site {} not found", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(origin: &str) -> SiteRecord {
        SiteRecord {
            title: "Title".to_string(),
            replaces: r#"{"a":"b"}"#.to_string(),
            date_macros: Some(r#"{"list":[]}"#.to_string()),
            ..SiteRecord::new(origin)
        }
    }

    #[test]
    fn test_insert_and_get_all() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(&site("https://one.com")).unwrap();
        store.insert(&site("https://two.com")).unwrap();

        let sites = store.get_all(true).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].id, id);
        assert_eq!(sites[0].origin_url, "https://one.com");
        assert_eq!(sites[0].host, None);
        assert_eq!(sites[0].replaces, r#"{"a":"b"}"#);
        assert!(sites[0].cache_enabled);
        assert!(!sites[0].link_up);
    }

    #[test]
    fn test_deleted_sites_excluded() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(&site("https://one.com")).unwrap();
        store.insert(&site("https://two.com")).unwrap();
        assert!(store.mark_deleted(id).unwrap());

        assert_eq!(store.get_all(true).unwrap().len(), 1);
        assert_eq!(store.get_all(false).unwrap().len(), 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_host_binding() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert(&site("https://one.com")).unwrap();
        let second = store.insert(&site("https://two.com")).unwrap();

        assert!(store.get_one("a.mirror.net").unwrap().is_none());
        store.update_host_binding(first, "a.mirror.net").unwrap();

        let bound = store.get_one("a.mirror.net").unwrap().unwrap();
        assert_eq!(bound.id, first);
        assert_eq!(bound.host.as_deref(), Some("a.mirror.net"));

        // hostnames are unique
        assert!(store.update_host_binding(second, "a.mirror.net").is_err());
        assert!(store.update_host_binding(999, "b.mirror.net").is_err());
    }

    #[test]
    fn test_update_friend_link() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert(&site("https://one.com")).unwrap();

        store.update_friend_link(id, "<a href='http://x.com'>x</a>\n").unwrap();
        let sites = store.get_all(true).unwrap();
        assert_eq!(sites[0].friend_link.as_deref(), Some("<a href='http://x.com'>x</a>\n"));
        assert!(sites[0].link_up);
    }

    #[test]
    fn test_open_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/mirror.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let id = store.insert(&site("https://one.com")).unwrap();
            store.update_host_binding(id, "a.mirror.net").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let site = store.get_one("a.mirror.net").unwrap().unwrap();
        assert_eq!(site.origin_url, "https://one.com");
    }
}
