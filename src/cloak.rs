//! Cloak decision: which visitors see the neutral page instead of the mirror

use crate::classify;
use crate::config::{CloakConfig, CrawlerConfig};
use regex::Regex;
use std::sync::OnceLock;

/// Cloaking mode selected by `cloak.jump_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JumpMode {
    /// Never cloak
    #[default]
    Off,
    /// Cloak every non-crawler visitor
    All,
    /// Cloak non-crawler visitors on mobile user agents
    Mobile,
}

impl JumpMode {
    pub fn from_config(value: u8) -> Self {
        match value {
            1 => JumpMode::All,
            2 => JumpMode::Mobile,
            _ => JumpMode::Off,
        }
    }
}

fn crawler_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Baiduspider|360Spider|Bytespider|Sogou|Yisou|bingbot|Googlebot")
            .expect("valid crawler regex")
    })
}

fn mobile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"iPhone|iPod|Android|ios|iOS|iPad|WebOS|Symbian|Windows Phone|Phone")
            .expect("valid mobile regex")
    })
}

fn apex_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"[^.]*\.(com\.cn|com\.tw|cc|cn|aero|arpa|asia|biz|cat|com|coop|edu|gov|int|info|jobs|mil|mobi|museum|name|net|org|pro|tel|trave)",
        )
        .expect("valid apex regex")
    })
}

fn www_or_mobile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"www\.|m\.").expect("valid www/m regex"))
}

/// Host contains `www.` or `m.` anywhere.
///
/// The match is unanchored, so any host ending a label in `m`
/// (`news.example.com.cn`, `forum.example.net`) also counts.
pub fn is_www_or_mobile_host(host: &str) -> bool {
    www_or_mobile_regex().is_match(host)
}

/// Host is a registrable domain according to the fixed suffix list
pub fn is_apex_host(host: &str) -> bool {
    apex_regex()
        .find(host)
        .is_some_and(|m| m.as_str() == host)
}

/// Decides between the mirror and the neutral page, and which crawlers are served
#[derive(Debug, Clone)]
pub struct CloakPolicy {
    mode: JumpMode,
    jump_index: bool,
    simulate_spiders: bool,
    /// Sorted, deduplicated client IPs allowed when simulating spiders
    spider_ips: Vec<String>,
    recognized: Vec<String>,
    approved: Vec<String>,
}

impl CloakPolicy {
    pub fn new(cloak: &CloakConfig, crawlers: &CrawlerConfig, mut spider_ips: Vec<String>) -> Self {
        spider_ips.retain(|ip| !ip.is_empty());
        spider_ips.sort();
        spider_ips.dedup();

        Self {
            mode: JumpMode::from_config(cloak.jump_mode),
            jump_index: cloak.jump_index,
            simulate_spiders: cloak.simulate_spiders,
            spider_ips,
            recognized: lowercase_all(&crawlers.recognized),
            approved: lowercase_all(&crawlers.approved),
        }
    }

    pub fn spider_ip_count(&self) -> usize {
        self.spider_ips.len()
    }

    /// Whether the visitor gets the neutral page
    pub fn should_cloak(&self, user_agent: &str, path: &str, host: &str, client_ip: &str) -> bool {
        if self.simulate_spiders {
            return self.spider_ips.binary_search_by(|ip| ip.as_str().cmp(client_ip)).is_err();
        }

        let crawler = crawler_regex().is_match(user_agent);
        let home = classify::is_home_page(path);
        let ext = classify::extension(path);
        let asset = classify::is_image_ext(ext) || classify::is_static_ext(ext);
        let primary_host = is_www_or_mobile_host(host) || is_apex_host(host);

        let targeted = match self.mode {
            JumpMode::Off => return false,
            JumpMode::All => !crawler,
            JumpMode::Mobile => !crawler && mobile_regex().is_match(user_agent),
        };

        if targeted && !(home && primary_host) && !asset {
            return true;
        }

        self.jump_index && !crawler && home && primary_host
    }

    /// User agent contains any recognized crawler signature
    pub fn is_crawler(&self, user_agent: &str) -> bool {
        contains_any(user_agent, &self.recognized)
    }

    /// User agent contains an approved crawler signature
    pub fn is_approved_crawler(&self, user_agent: &str) -> bool {
        contains_any(user_agent, &self.approved)
    }

    /// Recognized crawler that is not on the approved list
    pub fn is_rejected_crawler(&self, user_agent: &str) -> bool {
        self.is_crawler(user_agent) && !self.is_approved_crawler(user_agent)
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn contains_any(user_agent: &str, needles: &[String]) -> bool {
    let ua = user_agent.to_lowercase();
    needles.iter().any(|needle| ua.contains(needle.as_str()))
}

/// Read spider IP allow-list files, one address per line
pub fn load_spider_ips<P: AsRef<std::path::Path>>(paths: &[P]) -> anyhow::Result<Vec<String>> {
    let mut ips = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read spider IP file {}: {}", path.display(), e))?;
        ips.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0";
    const MOBILE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)";
    const BAIDU: &str = "Mozilla/5.0 (compatible; Baiduspider/2.0; +http://www.baidu.com/search/spider.html)";

    fn policy(mode: u8, jump_index: bool) -> CloakPolicy {
        let cloak = CloakConfig {
            jump_mode: mode,
            jump_index,
            ..Default::default()
        };
        CloakPolicy::new(&cloak, &CrawlerConfig::default(), Vec::new())
    }

    #[test]
    fn test_host_predicates() {
        assert!(is_apex_host("example.com"));
        assert!(is_apex_host("example.com.cn"));
        assert!(!is_apex_host("news.example.com"));
        assert!(!is_apex_host("localhost"));
        assert!(is_www_or_mobile_host("www.example.com"));
        assert!(is_www_or_mobile_host("m.example.com"));
        assert!(is_www_or_mobile_host("news.example.com.cn"));
        assert!(is_www_or_mobile_host("forum.example.net"));
        assert!(!is_www_or_mobile_host("news.example.net"));
        assert!(!is_www_or_mobile_host("example.org"));
    }

    #[test]
    fn test_com_cn_subdomain_home_is_served() {
        let p = policy(1, false);
        assert!(!p.should_cloak(BROWSER, "/", "news.example.com.cn", "1.2.3.4"));
        assert!(p.should_cloak(BROWSER, "/news/1.html", "news.example.com.cn", "1.2.3.4"));
        assert!(p.should_cloak(BROWSER, "/", "news.example.net", "1.2.3.4"));
    }

    #[test]
    fn test_mode_off_never_cloaks() {
        let p = policy(0, true);
        assert!(!p.should_cloak(BROWSER, "/news/1.html", "a.example.com", "1.2.3.4"));
        assert!(!p.should_cloak(BROWSER, "/", "www.example.com", "1.2.3.4"));
    }

    #[test]
    fn test_mode_all_table() {
        let p = policy(1, false);
        let cases = [
            // (ua, path, host, expected)
            (BROWSER, "/news/1.html", "a.example.com", true),
            (BROWSER, "/", "a.example.com", true),
            (BROWSER, "/", "www.example.com", false),
            (BROWSER, "/index.php", "example.com", false),
            (BROWSER, "/news/1.html", "www.example.com", true),
            (BROWSER, "/logo.png", "a.example.com", false),
            (BROWSER, "/style.css", "a.example.com", false),
            (BAIDU, "/news/1.html", "a.example.com", false),
            (BAIDU, "/", "a.example.com", false),
        ];
        for (ua, path, host, expected) in cases {
            assert_eq!(
                p.should_cloak(ua, path, host, "1.2.3.4"),
                expected,
                "ua={} path={} host={}",
                ua,
                path,
                host
            );
        }
    }

    #[test]
    fn test_jump_index_cloaks_primary_home_for_visitors() {
        let p = policy(1, true);
        assert!(p.should_cloak(BROWSER, "/", "www.example.com", "1.2.3.4"));
        assert!(p.should_cloak(BROWSER, "/", "example.com", "1.2.3.4"));
        assert!(!p.should_cloak(BAIDU, "/", "www.example.com", "1.2.3.4"));
        assert!(!p.should_cloak(BROWSER, "/logo.png", "www.example.com", "1.2.3.4"));
    }

    #[test]
    fn test_mode_mobile_table() {
        let p = policy(2, false);
        assert!(p.should_cloak(MOBILE, "/news/1.html", "a.example.com", "1.2.3.4"));
        assert!(!p.should_cloak(BROWSER, "/news/1.html", "a.example.com", "1.2.3.4"));
        assert!(!p.should_cloak(MOBILE, "/", "m.example.com", "1.2.3.4"));

        let p = policy(2, true);
        // home page rule applies to every non-crawler, mobile or not
        assert!(p.should_cloak(BROWSER, "/", "m.example.com", "1.2.3.4"));
    }

    #[test]
    fn test_simulate_spiders_overrides_mode() {
        let cloak = CloakConfig {
            jump_mode: 0,
            simulate_spiders: true,
            ..Default::default()
        };
        let ips = vec![
            "220.181.108.1".to_string(),
            "123.125.71.10".to_string(),
            "220.181.108.1".to_string(),
        ];
        let p = CloakPolicy::new(&cloak, &CrawlerConfig::default(), ips);
        assert_eq!(p.spider_ip_count(), 2);
        assert!(!p.should_cloak(BROWSER, "/", "a.example.com", "123.125.71.10"));
        assert!(!p.should_cloak(BROWSER, "/x", "a.example.com", "220.181.108.1"));
        assert!(p.should_cloak(BAIDU, "/", "a.example.com", "8.8.8.8"));
    }

    #[test]
    fn test_crawler_lists() {
        let p = policy(0, false);
        assert!(p.is_crawler(BAIDU));
        assert!(p.is_approved_crawler(BAIDU));
        assert!(!p.is_rejected_crawler(BAIDU));

        let ahrefs = "Mozilla/5.0 (compatible; AhrefsBot/7.0; +http://ahrefs.com/robot/)";
        assert!(p.is_rejected_crawler(ahrefs));
        assert!(!p.is_rejected_crawler(BROWSER));
    }

    #[test]
    fn test_load_spider_ips() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("1.json");
        let second = dir.path().join("2.json");
        std::fs::write(&first, "1.1.1.1\n\n 2.2.2.2 \n").unwrap();
        std::fs::write(&second, "# comment\n3.3.3.3\n").unwrap();

        let ips = load_spider_ips(&[first, second]).unwrap();
        assert_eq!(ips, vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]);

        assert!(load_spider_ips(&[dir.path().join("missing")]).is_err());
    }
}
