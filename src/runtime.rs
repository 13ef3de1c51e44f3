//! Proxy runtime: owns the telemetry client and the running listeners, and
//! applies configuration generations.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::proxy::{spawn_sweeper, ProxyServer};
use crate::telemetry::{TelemetryClient, TelemetryClientOptions};

/// One running configuration generation: the listener and sweeper tasks, and
/// the stop signal they all watch.
struct Generation {
    stop_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Generation {
    fn new() -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            stop_tx,
            tasks: Vec::new(),
        }
    }

    fn stop_rx(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Signal every task in this generation and wait for all of them.
    async fn halt(self) {
        let _ = self.stop_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct ProxyRuntime {
    telemetry: Arc<TelemetryClient>,
    current: Option<Generation>,
}

impl ProxyRuntime {
    pub fn new(opts: TelemetryClientOptions) -> Result<Self, url::ParseError> {
        let telemetry = Arc::new(TelemetryClient::new(opts)?);
        telemetry.start();
        Ok(Self {
            telemetry,
            current: None,
        })
    }

    /// Replace the active configuration: close all running listeners first,
    /// then start one per entry. A listener that fails to bind is logged and
    /// skipped; the others still run.
    pub async fn apply_config(&mut self, config: ProxyConfig) {
        self.stop_all().await;

        let mut generation = Generation::new();
        let mut started = 0usize;

        for (key, listener_cfg) in &config {
            let name = listener_cfg.name.clone().unwrap_or_else(|| key.clone());
            let bind = format!("{}:{}", listener_cfg.bind_host(), listener_cfg.target_port);
            let addr: SocketAddr = match bind.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::error!(listener = %name, bind = %bind, error = %err, "invalid bind address");
                    continue;
                }
            };

            let tcp = match TcpListener::bind(addr).await {
                Ok(tcp) => tcp,
                Err(err) => {
                    tracing::error!(listener = %name, bind = %bind, error = %err, "failed to bind listener");
                    continue;
                }
            };

            tracing::info!(
                listener = %name,
                bind = %bind,
                upstream = %listener_cfg.target_base(),
                kind = %listener_cfg.kind,
                "starting listener"
            );

            let server = ProxyServer::new(listener_cfg, &name, Arc::clone(&self.telemetry));
            generation
                .tasks
                .push(spawn_sweeper(server.state(), generation.stop_rx()));

            let server_stop = generation.stop_rx();
            let server_name = name.clone();
            generation.tasks.push(tokio::spawn(async move {
                if let Err(err) = server.run(tcp, server_stop).await {
                    tracing::error!(listener = %server_name, error = %err, "listener failed");
                }
            }));
            started += 1;
        }

        tracing::info!(listeners = started, "configuration applied");
        self.current = Some(generation);
    }

    /// Stop every running listener and its sweep task.
    pub async fn stop_all(&mut self) {
        if let Some(generation) = self.current.take() {
            generation.halt().await;
        }
    }

    /// Stop all listeners and the telemetry client. Unflushed telemetry and
    /// pending correlation state are dropped.
    pub async fn shutdown(&mut self) {
        self.stop_all().await;
        self.telemetry.stop();
    }
}
