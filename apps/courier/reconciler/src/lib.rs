//! Courier Reconciler Service
//!
//! Runs the two delivery controllers against a resource store.
//!
//! ## Architecture
//!
//! ```text
//! ResourceStore (memory | redis)
//!   ↓ change events + periodic resync
//! ResourceWatcher
//!   ↓ keys
//! Controller<DeliveryReconciler>       Controller<SenderConfigReconciler>
//!   ↓ resolve config/secret, send       ↓ validate provider settings
//! SMTP / Resend                          SenderConfig status
//!   ↓
//! SendRequest status
//! ```
//!
//! ## Features
//!
//! - Idempotent delivery: a `Sent` request is never sent again
//! - Bounded retries with a fixed backoff per request
//! - Graceful shutdown handling
//! - Health, readiness and Prometheus endpoints

use async_trait::async_trait;
use core_config::{
    env_or_default, env_parse, redis::RedisConfig, server::HealthServerConfig, ConfigError,
    Environment, FromEnv,
};
use domain_delivery::{
    DeliveryConfig, DeliveryReconciler, InMemoryStore, InMemoryUsageLedger, ObjectKey,
    ProviderFactory, RedisStore, ResourceStore, ResourceWatcher, SenderConfigReconciler,
};
use eyre::{Result, WrapErr};
use reconcile_worker::{health_router, Controller, ControllerConfig, HealthState, ReadinessProbe};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Which [`ResourceStore`] backs the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
        }
    }
}

/// Process-level settings that are not owned by a library crate.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub store_backend: StoreBackend,
    pub delivery_workers: usize,
    pub sender_config_workers: usize,
    pub reconcile_timeout: Duration,
    pub resync_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            delivery_workers: 4,
            sender_config_workers: 1,
            reconcile_timeout: Duration::from_secs(120),
            resync_interval: Duration::from_secs(300),
        }
    }
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store_backend = match env_or_default("STORE_BACKEND", "memory")
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "redis" => StoreBackend::Redis,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "STORE_BACKEND".to_string(),
                    details: format!("expected `memory` or `redis`, got `{other}`"),
                });
            }
        };

        let delivery_workers = env_parse("RECONCILE_WORKERS", defaults.delivery_workers)?;
        let sender_config_workers =
            env_parse("SENDER_CONFIG_WORKERS", defaults.sender_config_workers)?;
        for (key, value) in [
            ("RECONCILE_WORKERS", delivery_workers),
            ("SENDER_CONFIG_WORKERS", sender_config_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    details: "must be at least 1".to_string(),
                });
            }
        }

        let reconcile_timeout = Duration::from_secs(env_parse(
            "RECONCILE_TIMEOUT_SECS",
            defaults.reconcile_timeout.as_secs(),
        )?);
        let resync_interval = Duration::from_secs(env_parse(
            "RESYNC_INTERVAL_SECS",
            defaults.resync_interval.as_secs(),
        )?);
        if resync_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RESYNC_INTERVAL_SECS".to_string(),
                details: "must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            store_backend,
            delivery_workers,
            sender_config_workers,
            reconcile_timeout,
            resync_interval,
        })
    }
}

/// Readiness is the store answering a ping.
struct StoreProbe<S> {
    store: Arc<S>,
}

#[async_trait]
impl<S: ResourceStore + 'static> ReadinessProbe for StoreProbe<S> {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn check(&self) -> Result<(), String> {
        self.store.ping().await.map_err(|e| e.to_string())
    }
}

/// Start the health HTTP server
///
/// Provides `/health`, `/ready` and `/metrics`.
async fn start_health_server(health_state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app = health_router(health_state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the reconciler service
///
/// 1. Sets up error reports and structured logging
/// 2. Loads settings from the environment
/// 3. Connects the configured store
/// 4. Runs both controllers and the watcher until SIGINT/SIGTERM
///
/// # Errors
///
/// Returns an error if configuration is invalid or the store cannot be reached.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    reconcile_worker::init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting courier reconciler"
    );
    info!("Environment: {:?}", environment);

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let delivery_config =
        DeliveryConfig::from_env().wrap_err("Failed to load delivery configuration")?;
    let health_config =
        HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;

    info!(
        store = %settings.store_backend,
        delivery_workers = settings.delivery_workers,
        sender_config_workers = settings.sender_config_workers,
        reconcile_timeout_secs = settings.reconcile_timeout.as_secs(),
        resync_interval_secs = settings.resync_interval.as_secs(),
        "Worker settings loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    match settings.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory store; state is lost on restart");
            let store = Arc::new(InMemoryStore::new());
            run_with_store(store, settings, delivery_config, health_config, shutdown_rx).await
        }
        StoreBackend::Redis => {
            let redis_config =
                RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

            info!("Connecting to Redis...");
            let store = RedisStore::connect(&redis_config)
                .await
                .wrap_err("Failed to connect to Redis")?;
            info!("Connected to Redis successfully");

            let listener = store.spawn_event_listener(shutdown_rx.clone());
            let result = run_with_store(
                Arc::new(store),
                settings,
                delivery_config,
                health_config,
                shutdown_rx,
            )
            .await;

            if let Err(e) = listener.await {
                error!(error = %e, "Redis event listener panicked");
            }
            result
        }
    }
}

/// Wire controllers, watcher and health server around one store.
pub async fn run_with_store<S>(
    store: Arc<S>,
    settings: WorkerSettings,
    delivery_config: DeliveryConfig,
    health_config: HealthServerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: ResourceStore + 'static,
{
    // Process-local counts, exported as `delivery_usage_sent_total`
    let usage = Arc::new(InMemoryUsageLedger::new());

    let deliveries = Controller::<ObjectKey, _>::new(
        DeliveryReconciler::new(
            Arc::clone(&store),
            ProviderFactory::new(&delivery_config),
            usage,
            delivery_config.clone(),
        ),
        ControllerConfig::new("delivery")
            .with_max_concurrent_reconciles(settings.delivery_workers)
            .with_reconcile_timeout(settings.reconcile_timeout),
    );
    let sender_configs = Controller::<ObjectKey, _>::new(
        SenderConfigReconciler::new(
            Arc::clone(&store),
            ProviderFactory::new(&delivery_config),
            delivery_config,
        ),
        ControllerConfig::new("sender-config")
            .with_max_concurrent_reconciles(settings.sender_config_workers)
            .with_reconcile_timeout(settings.reconcile_timeout),
    );

    let watcher = ResourceWatcher::new(
        Arc::clone(&store),
        deliveries.queue(),
        sender_configs.queue(),
        settings.resync_interval,
    );

    let health_state = HealthState::new(
        Arc::new(StoreProbe {
            store: Arc::clone(&store),
        }),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Starting controllers...");
    tokio::join!(
        watcher.run(shutdown.clone()),
        deliveries.run(shutdown.clone()),
        sender_configs.run(shutdown),
    );

    info!("Courier reconciler stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain_delivery::{
        DeliveryState, SendRequest, SendRequestSpec, SenderConfigSpec, SenderPhase,
    };

    #[test]
    fn test_settings_defaults() {
        temp_env::with_vars_unset(
            [
                "STORE_BACKEND",
                "RECONCILE_WORKERS",
                "SENDER_CONFIG_WORKERS",
                "RECONCILE_TIMEOUT_SECS",
                "RESYNC_INTERVAL_SECS",
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.store_backend, StoreBackend::Memory);
                assert_eq!(settings.delivery_workers, 4);
                assert_eq!(settings.sender_config_workers, 1);
                assert_eq!(settings.reconcile_timeout, Duration::from_secs(120));
                assert_eq!(settings.resync_interval, Duration::from_secs(300));
            },
        );
    }

    #[test]
    fn test_settings_from_env() {
        temp_env::with_vars(
            [
                ("STORE_BACKEND", Some("Redis")),
                ("RECONCILE_WORKERS", Some("8")),
                ("RESYNC_INTERVAL_SECS", Some("30")),
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.store_backend, StoreBackend::Redis);
                assert_eq!(settings.delivery_workers, 8);
                assert_eq!(settings.resync_interval, Duration::from_secs(30));
            },
        );
    }

    #[test]
    fn test_settings_reject_invalid_values() {
        temp_env::with_var("STORE_BACKEND", Some("postgres"), || {
            assert!(matches!(
                WorkerSettings::from_env(),
                Err(ConfigError::InvalidValue { .. })
            ));
        });
        temp_env::with_var("RECONCILE_WORKERS", Some("0"), || {
            assert!(matches!(
                WorkerSettings::from_env(),
                Err(ConfigError::InvalidValue { .. })
            ));
        });
        temp_env::with_var("RESYNC_INTERVAL_SECS", Some("soon"), || {
            assert!(matches!(
                WorkerSettings::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
    }

    #[tokio::test]
    async fn test_store_probe_reports_outage() {
        let store = Arc::new(InMemoryStore::new());
        let probe = StoreProbe {
            store: Arc::clone(&store),
        };
        assert_eq!(probe.name(), "store");
        assert!(probe.check().await.is_ok());

        store.set_unavailable(true);
        assert!(probe.check().await.is_err());
    }

    #[tokio::test]
    async fn test_run_with_store_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = WorkerSettings {
            delivery_workers: 1,
            ..Default::default()
        };

        let running = tokio::spawn(run_with_store(
            Arc::clone(&store),
            settings,
            DeliveryConfig::default(),
            HealthServerConfig::new("127.0.0.1", 0),
            shutdown_rx,
        ));

        // Missing secret: validation fails without touching the network,
        // and the request parks on a missing config.
        let config_key = ObjectKey::new("acme", "transactional");
        store
            .apply_sender_config(
                &config_key,
                SenderConfigSpec::new("carrier-pigeon", "creds", "noreply@acme.test"),
            )
            .await
            .unwrap();
        let request_key = store
            .create_send_request(SendRequest::new(
                "acme",
                "welcome",
                SendRequestSpec::new("missing", "ada@example.com", "Hi", "Hello"),
            ))
            .await
            .unwrap()
            .key();

        let validated = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let config = store.get_sender_config(&config_key).await.unwrap().unwrap();
                if config.status.phase == SenderPhase::Invalid {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(validated.is_ok());

        let request = store.get_send_request(&request_key).await.unwrap().unwrap();
        assert_ne!(request.status.delivery_state, DeliveryState::Sent);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
