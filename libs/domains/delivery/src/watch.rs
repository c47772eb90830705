//! Feeds the work queues from store change events plus a periodic resync.

use crate::models::{ChangeType, DeliveryState, ObjectKey, ResourceEvent, ResourceKind};
use crate::store::{ResourceStore, StoreResult};
use reconcile_worker::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct ResourceWatcher<S> {
    store: Arc<S>,
    deliveries: Arc<WorkQueue<ObjectKey>>,
    sender_configs: Arc<WorkQueue<ObjectKey>>,
    resync_interval: Duration,
}

impl<S: ResourceStore> ResourceWatcher<S> {
    pub fn new(
        store: Arc<S>,
        deliveries: Arc<WorkQueue<ObjectKey>>,
        sender_configs: Arc<WorkQueue<ObjectKey>>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            store,
            deliveries,
            sender_configs,
            resync_interval,
        }
    }

    /// Enqueue every request that is not `Sent` and every sender config.
    pub async fn resync(&self) -> StoreResult<(usize, usize)> {
        let requests = self.store.list_send_requests().await?;
        let mut pending = 0;
        for request in requests
            .iter()
            .filter(|r| r.status.delivery_state != DeliveryState::Sent)
        {
            self.deliveries.add(request.key());
            pending += 1;
        }

        let configs = self.store.list_sender_configs().await?;
        for config in &configs {
            self.sender_configs.add(config.key());
        }

        debug!(requests = pending, sender_configs = configs.len(), "Resynced");
        Ok((pending, configs.len()))
    }

    /// Status events are the reconcilers' own writes and need no reaction.
    pub fn route(&self, event: &ResourceEvent) {
        match (event.kind, event.change) {
            (ResourceKind::SendRequest, ChangeType::Created | ChangeType::Updated) => {
                self.deliveries.add(event.key.clone());
            }
            (ResourceKind::SenderConfig, ChangeType::Created | ChangeType::Updated) => {
                self.sender_configs.add(event.key.clone());
            }
            _ => {}
        }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        // Subscribe before the first resync so nothing slips between them
        let mut events = self.store.subscribe();

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            "Starting resource watcher"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Resync failed");
                    }
                }
                received = events.recv() => match received {
                    Ok(event) => self.route(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream lagged, resyncing");
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "Resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store event channel closed");
                        break;
                    }
                },
            }
        }

        info!("Resource watcher stopped");
    }
}
