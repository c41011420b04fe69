//! Oscar Actor Runtime
//!
//! Location-transparent actors scheduled on worker pools, with supervision
//! and persistent TCP links between processes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │ ActorSystem  127.0.0.1:7100  │          │ ActorSystem  127.0.0.1:7200  │
//! │                              │          │                              │
//! │  Router ──┬─ Pool "main"     │   Link   │  Listener ─ Router           │
//! │           │   ├ ready queue  │ ───────► │               └ Pool "main"  │
//! │           │   ├ workers x N  │ ◄─────── │                  ├ mailboxes │
//! │           │   └ supervision  │ replies  │                  └ ...       │
//! │           └─ LinkPool ───────┼──────────┘                              │
//! └──────────────────────────────┘                                         │
//! ```
//!
//! An [`ActorAddress`] names endpoint, pool and uid. Sending to an address
//! on this system goes straight to the actor's mailbox; any other endpoint
//! goes over the link for that endpoint. The caller does not see which.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use oscar::{Actor, ActorContext, ActorSystem, HandlerError, MessageKind, RestartPolicy, RuntimeConfig};
//! use std::time::Duration;
//!
//! #[derive(Clone, Default)]
//! struct Counter {
//!     total: u64,
//! }
//!
//! #[async_trait]
//! impl Actor for Counter {
//!     async fn handle(
//!         &mut self,
//!         _ctx: &mut ActorContext,
//!         _kind: MessageKind,
//!         payload: Bytes,
//!     ) -> Result<Option<Bytes>, HandlerError> {
//!         self.total += oscar::decode::<u64>(&payload)?;
//!         oscar::encode(&self.total)
//!     }
//! }
//!
//! # async fn run() -> oscar::Result<()> {
//! let system = ActorSystem::new(RuntimeConfig::default())?;
//! system.add_pool("main")?;
//! let counter = system.spawn("main", Counter::default(), RestartPolicy::Restart).await?;
//! let total: u64 = system.call_typed(&counter, &5u64, Duration::from_secs(1)).await?;
//! assert_eq!(total, 5);
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod actor_ref;
pub mod error;
pub mod mailbox;
pub mod pool;
pub mod registry;
mod router;
pub mod supervisor;
pub mod system;
pub mod telemetry;
pub mod watch;

pub use actor::{decode, encode, Actor, ActorContext, HandlerError, MessageKind};
pub use actor_ref::ActorRef;
pub use error::{ActorError, Result};
pub use mailbox::{MailboxStatus, Watermarks};
pub use pool::{PoolMetrics, PoolSettings, PoolStats};
pub use registry::ActorTypeRegistry;
pub use supervisor::{RestartLimit, SupervisorAction};
pub use system::{link_config, ActorSystem};
pub use telemetry::init_tracing;
pub use watch::LifecycleStream;

pub use oscar_config::RuntimeConfig;
pub use oscar_network::{
    ActorAddress, ActorUid, LifecycleEvent, OnParentExit, PoolId, RestartPolicy, SpawnOptions,
    TellPolicy,
};
