//! Declarative email delivery.
//!
//! Clients create `SendRequest` resources in a [`store::ResourceStore`]; the
//! [`DeliveryReconciler`] resolves the referenced `SenderConfig` and `Secret`,
//! picks a transport through a [`TransportFactory`] and records the outcome in
//! the request's status. The [`SenderConfigReconciler`] validates sender
//! configs once per spec generation.
//!
//! Both reconcilers implement [`reconcile_worker::Reconciler`] and are driven
//! by a `reconcile_worker::Controller`, fed by a [`ResourceWatcher`].

pub mod config;
pub mod error;
pub mod factory;
pub mod models;
pub mod providers;
pub mod reconciler;
pub mod resolver;
pub mod sender_config;
pub mod store;
pub mod usage;
pub mod watch;

pub use config::DeliveryConfig;
pub use error::{DeliveryError, DeliveryResult};
pub use factory::{FactoryError, ProviderFactory, ProviderKind, ProviderSettings, TransportFactory};
pub use models::*;
pub use providers::{
    FailureKind, Provider, Transport, TransportError, TransportRequest, TransportResult,
};
pub use reconciler::{DeliveryOutcome, DeliveryReconciler};
pub use resolver::{ConfigResolver, ResolveError, ResolvedSender};
pub use sender_config::{SenderConfigOutcome, SenderConfigReconciler};
pub use store::{InMemoryStore, RedisStore, ResourceStore, StoreError, StoreResult};
pub use usage::{InMemoryUsageLedger, UsageError, UsageRecorder};
pub use watch::ResourceWatcher;
