use tokenwatch::config::Config;
use tokenwatch::dashboard::{self, DashboardState};
use tokenwatch::monitor::{MonitorController, MonitorHandle, Session};
use tokenwatch::notify::{LogNotifier, NotificationSink, WebhookNotifier};
use tokenwatch::onchain::{AlloyLedger, TokenInspector};
use tokenwatch::registry::{chain_name, designated_token, TokenRegistry};

use alloy::primitives::Address;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "tokenwatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The WebSocket and webhook clients both need a process-wide TLS provider.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // Load .env if present
    let _ = dotenvy::dotenv();

    let config_file = Path::new(CONFIG_PATH);
    let config = if config_file.exists() {
        Config::load(config_file)?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("tokenwatch v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_file.exists() {
        info!("no {} found, using env-only config", CONFIG_PATH);
    }

    let account = config.account()?;
    if account.is_none() {
        warn!("no account configured (set TOKENWATCH_ACCOUNT) - monitor stays idle");
    }

    // --- Ledger ---
    let ledger = Arc::new(AlloyLedger::connect(config.ws_url()?).await?);

    // --- Notifications ---
    let notifier: Arc<dyn NotificationSink> =
        if config.notifications.enabled && !config.notifications.webhook_url.is_empty() {
            info!("webhook notifications enabled");
            Arc::new(WebhookNotifier::new(
                config.notifications.webhook_url.clone(),
                true,
            )?)
        } else {
            Arc::new(LogNotifier)
        };

    // --- Monitor ---
    let (controller, monitor) = MonitorController::new(&config.monitor, ledger.clone(), notifier);
    let monitor_task = controller.start();

    // --- Dashboard ---
    if config.dashboard.enabled {
        let state = DashboardState {
            monitor: monitor.clone(),
        };
        let bind = config.dashboard.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(state, &bind).await {
                error!(error = %e, "dashboard server failed");
            }
        });
    }

    // --- Session Provider ---
    let poll = Duration::from_secs(config.chain.poll_interval_secs.max(1));
    let mut interval = tokio::time::interval(poll);
    let mut last: Option<Session> = None;

    info!("monitoring - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(session) = current_session(ledger.as_ref(), &config, account).await else {
                    continue;
                };
                if last.as_ref() != Some(&session) {
                    publish_session(&monitor, &session, last.as_ref());
                    last = Some(session);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    if let Err(e) = monitor.shutdown() {
        warn!(error = %e, "monitor already stopped");
    }
    monitor_task.await?;
    Ok(())
}

/// What the chain and registry report right now. `None` when the registry
/// cannot be read, so the previous session stays in force.
async fn current_session(
    ledger: &AlloyLedger,
    config: &Config,
    account: Option<Address>,
) -> Option<Session> {
    let chain_id = match ledger.chain_id().await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %e, "failed to read chain id");
            None
        }
    };

    let tokens = match chain_id {
        Some(chain) => {
            let registry =
                match TokenRegistry::load(&config.registry.path, config.registry.include_designated) {
                    Ok(r) => r,
                    Err(e) => {
                        error!(error = %e, path = %config.registry.path.display(), "failed to load token registry");
                        return None;
                    }
                };
            if config.registry.include_designated && designated_token(chain).is_none() {
                debug!("USDT not supported on {}", chain_name(chain));
            }
            registry.active_tokens(chain)
        }
        None => Vec::new(),
    };

    Some(Session {
        account,
        chain_id,
        connected: account.is_some() && chain_id.is_some(),
        tokens,
    })
}

fn publish_session(monitor: &MonitorHandle, session: &Session, previous: Option<&Session>) {
    if previous.map(|p| p.chain_id) != Some(session.chain_id) {
        match session.chain_id {
            Some(chain) => info!(chain_id = chain, network = %chain_name(chain), "network detected"),
            None => warn!("network unknown"),
        }
    }
    info!(
        connected = session.connected,
        tokens = session.tokens.len(),
        "session changed"
    );
    if let Err(e) = monitor.update_session(session.clone()) {
        error!(error = %e, "failed to push session to monitor");
    }
}
