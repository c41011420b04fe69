//! Message Router
//!
//! Resolves an address to a local pool cell or to the link for its
//! endpoint. Resolution is a pure function of the address.

use crate::error::{ActorError, Result};
use crate::pool::{ActorCell, Pool};
use oscar_network::{ActorAddress, Link, LinkPool, PoolId, LOCAL_ENDPOINT};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Where an address lives
pub(crate) enum Route {
    Local { pool: Arc<Pool>, cell: Arc<ActorCell> },
    Remote(Link),
}

pub(crate) struct Router {
    endpoint: String,
    pools: RwLock<HashMap<PoolId, Arc<Pool>>>,
    links: LinkPool,
}

impl Router {
    pub fn new(endpoint: String, links: LinkPool) -> Self {
        Self {
            endpoint,
            pools: RwLock::new(HashMap::new()),
            links,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn links(&self) -> &LinkPool {
        &self.links
    }

    /// Whether `address` is hosted by this process
    pub fn is_local(&self, address: &ActorAddress) -> bool {
        address.endpoint() == self.endpoint || address.endpoint() == LOCAL_ENDPOINT
    }

    pub fn resolve(&self, address: &ActorAddress) -> Result<Route> {
        if !self.is_local(address) {
            return Ok(Route::Remote(self.links.link(address.endpoint())));
        }
        let pool = self.pool(address.pool_id())?;
        let cell = pool
            .cell(address.uid())
            .ok_or_else(|| ActorError::routing(format!("no actor at {}", address)))?;
        Ok(Route::Local { pool, cell })
    }

    pub fn pool(&self, pool_id: &PoolId) -> Result<Arc<Pool>> {
        self.pools
            .read()
            .get(pool_id)
            .cloned()
            .ok_or_else(|| ActorError::routing(format!("unknown pool {}", pool_id)))
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Register a pool; false if the id is taken
    pub fn insert_pool(&self, pool: Arc<Pool>) -> bool {
        let mut pools = self.pools.write();
        if pools.contains_key(pool.id()) {
            return false;
        }
        pools.insert(pool.id().clone(), pool);
        true
    }

    pub fn remove_pool(&self, pool_id: &PoolId) -> Option<Arc<Pool>> {
        self.pools.write().remove(pool_id)
    }

    pub fn drain_pools(&self) -> Vec<Arc<Pool>> {
        self.pools.write().drain().map(|(_, pool)| pool).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use oscar_network::{ActorUid, LinkState};

    fn router() -> Router {
        Router::new("127.0.0.1:7100".to_string(), LinkPool::default())
    }

    #[test]
    fn test_unknown_pool_and_actor_are_routing_failures() {
        let router = router();
        let address = ActorAddress::new("127.0.0.1:7100", PoolId::new("main"), ActorUid::new("a"));
        assert!(matches!(router.resolve(&address), Err(ActorError::RoutingFailure(_))));

        router.insert_pool(Pool::new(PoolId::new("main"), PoolSettings::default().with_workers(1)));
        assert!(matches!(router.resolve(&address), Err(ActorError::RoutingFailure(_))));
    }

    #[test]
    fn test_foreign_endpoint_resolves_to_lazy_link() {
        let router = router();
        let address = ActorAddress::new("10.1.2.3:7100", PoolId::new("main"), ActorUid::new("a"));
        match router.resolve(&address) {
            Ok(Route::Remote(link)) => {
                assert_eq!(link.endpoint(), "10.1.2.3:7100");
                assert_eq!(link.state(), LinkState::Idle);
            }
            _ => panic!("expected a remote route"),
        }
        assert_eq!(router.links().stats().total_links, 1);
    }

    #[test]
    fn test_local_marker_is_local() {
        let router = router();
        let address = ActorAddress::new(LOCAL_ENDPOINT, PoolId::new("main"), ActorUid::new("a"));
        assert!(router.is_local(&address));
    }

    #[test]
    fn test_duplicate_pool_is_rejected() {
        let router = router();
        assert!(router.insert_pool(Pool::new(PoolId::new("main"), PoolSettings::default())));
        assert!(!router.insert_pool(Pool::new(PoolId::new("main"), PoolSettings::default())));
        assert_eq!(router.pools().len(), 1);
    }
}
