//! Link Pool
//!
//! Endpoint → [`Link`] map shared by the router. The lock guards map
//! mutation only; traffic goes through the cloned link handle.

use super::{Link, LinkConfig, LinkState};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPoolStats {
    pub total_links: usize,
    pub connected_links: usize,
    pub pending_calls: usize,
    pub buffered_tells: usize,
    /// Buffered tells discarded by failed connection cycles
    pub dropped_tells: u64,
}

/// Links to remote endpoints, created lazily
pub struct LinkPool {
    links: RwLock<HashMap<String, Link>>,
    config: LinkConfig,
}

impl LinkPool {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Link for `endpoint`, created on first use
    ///
    /// Creating a link does not connect it; the first send does.
    pub fn link(&self, endpoint: &str) -> Link {
        if let Some(link) = self.links.read().get(endpoint) {
            if link.state() != LinkState::Closed {
                return link.clone();
            }
        }

        let mut links = self.links.write();
        match links.get(endpoint) {
            Some(link) if link.state() != LinkState::Closed => link.clone(),
            _ => {
                debug!(endpoint = %endpoint, "Creating link");
                let link = Link::new(endpoint, self.config.clone());
                links.insert(endpoint.to_string(), link.clone());
                link
            }
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<Link> {
        self.links.read().get(endpoint).cloned()
    }

    /// Remove and close the link for `endpoint`
    pub fn remove(&self, endpoint: &str) -> Option<Link> {
        let link = self.links.write().remove(endpoint);
        if let Some(link) = &link {
            link.close();
        }
        link
    }

    /// Close every link
    pub fn close_all(&self) {
        let links: Vec<Link> = self.links.write().drain().map(|(_, link)| link).collect();
        for link in links {
            link.close();
        }
    }

    pub fn stats(&self) -> LinkPoolStats {
        let links = self.links.read();
        links.values().fold(
            LinkPoolStats {
                total_links: links.len(),
                ..Default::default()
            },
            |mut stats, link| {
                if link.is_connected() {
                    stats.connected_links += 1;
                }
                stats.pending_calls += link.pending_calls();
                stats.buffered_tells += link.buffered_tells();
                stats.dropped_tells += link.metrics().dropped_tells;
                stats
            },
        )
    }
}

impl Default for LinkPool {
    fn default() -> Self {
        Self::new(LinkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::TellPolicy;

    #[test]
    fn test_link_is_shared_per_endpoint() {
        let pool = LinkPool::default();
        let a = pool.link("10.0.0.1:7100");
        let b = pool.link("10.0.0.1:7100");
        let c = pool.link("10.0.0.2:7100");

        assert_eq!(a.endpoint(), b.endpoint());
        assert_ne!(a.endpoint(), c.endpoint());
        assert_eq!(pool.stats().total_links, 2);
        assert_eq!(pool.stats().connected_links, 0);
    }

    #[test]
    fn test_closed_link_is_replaced() {
        let pool = LinkPool::default();
        let first = pool.link("10.0.0.1:7100");
        first.close();

        let second = pool.link("10.0.0.1:7100");
        assert_eq!(second.state(), LinkState::Idle);
    }

    #[test]
    fn test_overrides_apply_per_endpoint() {
        let pool = LinkPool::new(
            LinkConfig::default()
                .with_tell_policy(TellPolicy::Buffer { max: 4 })
                .with_override("10.0.0.2:7100", TellPolicy::FailFast),
        );
        assert_eq!(pool.link("10.0.0.1:7100").tell_policy(), TellPolicy::Buffer { max: 4 });
        assert_eq!(pool.link("10.0.0.2:7100").tell_policy(), TellPolicy::FailFast);
    }

    #[test]
    fn test_remove_closes() {
        let pool = LinkPool::default();
        let link = pool.link("10.0.0.1:7100");
        pool.remove("10.0.0.1:7100");
        assert_eq!(link.state(), LinkState::Closed);
        assert!(pool.get("10.0.0.1:7100").is_none());
    }
}
