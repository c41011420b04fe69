//! Actor Type Registry
//!
//! Named constructors for actors that remote systems may create with
//! `spawn_remote`. The creating side sends a type name and opaque init
//! bytes; the hosting side looks the name up here.

use crate::actor::{Actor, HandlerError};
use crate::error::{ActorError, Result};
use crate::pool::ActorFactory;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Constructor = Arc<dyn Fn(&[u8]) -> std::result::Result<ActorFactory, HandlerError> + Send + Sync>;

#[derive(Default)]
pub struct ActorTypeRegistry {
    types: RwLock<HashMap<String, Constructor>>,
}

impl std::fmt::Debug for ActorTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl ActorTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `type_name`, building the initial value from init bytes
    ///
    /// Re-registering a name replaces the previous constructor.
    pub fn register<A, F>(&self, type_name: impl Into<String>, build: F)
    where
        A: Actor + Clone,
        F: Fn(&[u8]) -> std::result::Result<A, HandlerError> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        debug!(actor_type = %type_name, "Registering actor type");
        let constructor: Constructor = Arc::new(move |init: &[u8]| {
            let template = build(init)?;
            let factory: ActorFactory = Box::new(move || Box::new(template.clone()) as Box<dyn Actor>);
            Ok(factory)
        });
        self.types.write().insert(type_name, constructor);
    }

    /// Register a type whose initial value is the bincode-decoded init bytes
    pub fn register_typed<A>(&self, type_name: impl Into<String>)
    where
        A: Actor + Clone + DeserializeOwned,
    {
        self.register(type_name, |init: &[u8]| {
            bincode::deserialize::<A>(init).map_err(HandlerError::from)
        });
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.read().contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn build(&self, type_name: &str, init: &[u8]) -> Result<ActorFactory> {
        let constructor = self
            .types
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| ActorError::Rejected(format!("unknown actor type {}", type_name)))?;
        constructor(init).map_err(|e| ActorError::Rejected(format!("cannot build {}: {}", type_name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorContext, MessageKind};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    #[async_trait]
    impl Actor for Counter {
        async fn handle(
            &mut self,
            _ctx: &mut ActorContext,
            _kind: MessageKind,
            _payload: Bytes,
        ) -> std::result::Result<Option<Bytes>, HandlerError> {
            Ok(None)
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let registry = ActorTypeRegistry::new();
        assert!(matches!(registry.build("Counter", &[]), Err(ActorError::Rejected(_))));
    }

    #[test]
    fn test_typed_registration_decodes_init() {
        let registry = ActorTypeRegistry::new();
        registry.register_typed::<Counter>("Counter");
        assert!(registry.contains("Counter"));
        assert_eq!(registry.type_names(), vec!["Counter".to_string()]);

        let init = bincode::serialize(&Counter { value: 7 }).unwrap();
        assert!(registry.build("Counter", &init).is_ok());
        assert!(matches!(registry.build("Counter", &[1]), Err(ActorError::Rejected(_))));
    }
}
