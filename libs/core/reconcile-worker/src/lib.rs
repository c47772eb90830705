//! Reconcile Worker Framework
//!
//! A small, level-triggered controller runtime: something notices that a
//! resource may be out of date, enqueues its key, and a pool of workers calls a
//! [`Reconciler`] until the resource converges.
//!
//! ## Features
//!
//! - **Work queue**: `WorkQueue<K>` de-duplicates keys and never hands the same
//!   key to two workers at once
//! - **Delayed requeue**: reconcilers ask to be called again after a delay
//!   instead of sleeping
//! - **Error backoff**: transient errors requeue with per-key exponential backoff
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use reconcile_worker::{Action, Controller, ControllerConfig, Reconciler, ReconcileError};
//!
//! struct MyReconciler;
//!
//! #[async_trait]
//! impl Reconciler<String> for MyReconciler {
//!     async fn reconcile(&self, key: &String) -> Result<Action, ReconcileError> {
//!         Ok(Action::Done)
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "my-reconciler"
//!     }
//! }
//!
//! let controller = Controller::new(MyReconciler, ControllerConfig::new("my-controller"));
//! controller.queue().add("some-key".to_string());
//! controller.run(shutdown_rx).await;
//! ```

mod config;
mod controller;
mod error;
mod health;
pub mod metrics;
mod queue;

pub use config::ControllerConfig;
pub use controller::{Action, Controller, Reconciler};
pub use error::{ErrorCategory, ReconcileError};
pub use health::{health_router, HealthState, ReadinessProbe};
pub use metrics::{init_metrics, ControllerMetrics};
pub use queue::WorkQueue;
