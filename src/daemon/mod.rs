use crate::concurrency::Limiter;
use crate::config::Config;
use crate::connection::{self, ConnectionFactory, ConnectionSupervisor, SessionMonitor};
use crate::gateway::{self, AppState};
use crate::history::{FileTurnStorage, HistoryStore};
use crate::pipeline::{Dispatch, InboundMessage, MessagePipeline};
use crate::providers::{self, Completer};
use crate::status_events::StatusHub;
use anyhow::Result;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Every long-lived piece of a running relay, wired together.
pub struct Relay {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub pipeline: Arc<MessagePipeline>,
    pub hub: Arc<StatusHub>,
    pub monitor: Arc<SessionMonitor>,
    inbound: Option<mpsc::Receiver<InboundMessage>>,
}

impl Relay {
    /// Wire the core together. Must run inside a tokio runtime.
    pub fn assemble(
        config: &Config,
        factory: Arc<dyn ConnectionFactory>,
        completer: Arc<dyn Completer>,
    ) -> Self {
        let hub = Arc::new(StatusHub::new());
        let (supervisor, inbound) =
            ConnectionSupervisor::new(config.session_name.clone(), factory, hub.clone());
        let history = Arc::new(HistoryStore::new(
            Arc::new(FileTurnStorage::new(config.history_dir())),
            config.history.max_turns,
        ));
        let limiter = Arc::new(Limiter::new(config.limiter.max_concurrent));
        let pipeline = Arc::new(MessagePipeline::new(
            &config.pipeline,
            limiter,
            history,
            completer,
            supervisor.clone(),
            hub.clone(),
        ));
        let monitor = Arc::new(SessionMonitor::new(supervisor.clone()));

        Self {
            supervisor,
            pipeline,
            hub,
            monitor,
            inbound: Some(inbound),
        }
    }

    pub fn app_state(&self, web_dir: Option<PathBuf>) -> AppState {
        AppState {
            supervisor: self.supervisor.clone(),
            pipeline: self.pipeline.clone(),
            hub: self.hub.clone(),
            web_dir: web_dir.map(Arc::new),
        }
    }

    /// Start feeding inbound messages to the pipeline. Only the first call
    /// returns a handle.
    pub fn spawn_inbound_pump(&mut self) -> Option<JoinHandle<()>> {
        let mut inbound = self.inbound.take()?;
        let pipeline = self.pipeline.clone();
        Some(tokio::spawn(async move {
            crate::health::mark_component_ok("inbound");
            while let Some(message) = inbound.recv().await {
                if let Dispatch::Queued(task) = pipeline.handle_inbound(message).await {
                    tokio::spawn(async move {
                        if let Err(e) = task.await {
                            tracing::error!("Completion task did not finish: {e}");
                        }
                    });
                }
            }
            crate::health::mark_component_error("inbound", "inbound stream closed");
        }))
    }
}

pub async fn run(config: Config, host: String, port: u16) -> Result<()> {
    let initial_backoff = config.reliability.component_initial_backoff_secs.max(1);
    let max_backoff = config
        .reliability
        .component_max_backoff_secs
        .max(initial_backoff);

    crate::health::mark_component_ok("daemon");

    let factory = connection::create_factory(&config.connection.kind)?;
    let completer: Arc<dyn Completer> = Arc::from(providers::create_completer(&config.provider)?);
    {
        let completer = completer.clone();
        tokio::spawn(async move {
            if let Err(e) = completer.warmup().await {
                tracing::warn!("Provider warmup failed: {e:#}");
            }
        });
    }
    let mut relay = Relay::assemble(&config, factory, completer);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.extend(relay.spawn_inbound_pump());
    handles.push(tokio::spawn(relay.monitor.clone().run_forever(Duration::from_secs(
        config.monitor.interval_secs,
    ))));

    let gateway_handle = {
        let state = relay.app_state(config.gateway.web_dir.clone());
        let gateway_host = host.clone();
        let rx = shutdown_rx.clone();
        spawn_component_supervisor(
            "gateway",
            initial_backoff,
            max_backoff,
            shutdown_rx.clone(),
            move || {
                let state = state.clone();
                let host = gateway_host.clone();
                let mut rx = rx.clone();
                async move {
                    gateway::run_gateway(&host, port, state, async move {
                        let _ = rx.wait_for(|stop| *stop).await;
                    })
                    .await
                }
            },
        )
    };

    if config.connection.autostart {
        let supervisor = relay.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.start().await {
                tracing::error!("Initial connection attempt failed: {e}; the session monitor will retry");
            }
        });
    }

    tracing::info!(
        session = %config.session_name,
        connection = %config.connection.kind,
        "Relay daemon started"
    );
    println!("🦀 chatrelay daemon started");
    println!("   Gateway:  http://{host}:{port}");
    println!("   Session:  {}", config.session_name);
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    crate::health::mark_component_error("daemon", "shutdown requested");

    let grace = Duration::from_secs(config.gateway.shutdown_grace_secs.max(1));
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(grace, relay.supervisor.stop()).await {
        Ok(Ok(())) => tracing::info!("Connection closed"),
        Ok(Err(e)) => tracing::warn!("Connection did not close cleanly: {e}"),
        Err(_) => tracing::warn!("Connection close timed out after {}s", grace.as_secs()),
    }
    if tokio::time::timeout(grace, gateway_handle).await.is_err() {
        tracing::warn!("Gateway did not drain within {}s", grace.as_secs());
    }

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Run a component forever, restarting it with exponential backoff whenever it
/// fails or returns. Stops once `shutdown` flips to `true`.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            let outcome = run_component().await;
            if *shutdown.borrow() {
                tracing::info!("Daemon component '{name}' stopped");
                return;
            }
            match outcome {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                }
                Err(e) => {
                    crate::health::mark_component_error(name, format!("{e:#}"));
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
