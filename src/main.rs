use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use meal_sync::channel::ChannelState;
use meal_sync::config::Config;
use meal_sync::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let (state, notifications) = AppState::initialize(&config);

    if let Some(mut rx) = notifications {
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                info!(
                    variant = ?n.variant,
                    title = %n.title,
                    description = n.description.as_deref().unwrap_or(""),
                    "notification"
                );
            }
        });
    }

    let mut connectivity = state.manager.connectivity();
    let conn_state = state.clone();
    tokio::spawn(async move {
        while connectivity.changed().await.is_ok() {
            let online = *connectivity.borrow_and_update();
            let subject_id = conn_state
                .manager
                .identity()
                .map(|id| id.subject_id.to_string())
                .unwrap_or_default();
            info!(online, %subject_id, rooms = ?conn_state.manager.rooms(), "push connectivity changed");
        }
    });

    // Mount pages per identity, then load what they read.
    let mut identities = state.session.subscribe();
    let mount_state = state.clone();
    tokio::spawn(async move {
        loop {
            let identity = identities.borrow_and_update().clone();
            if let Err(e) = mount_state.mount_for(identity.as_ref()) {
                error!(error = %e, "failed to mount pages");
            }
            mount_state.refresh(None).await;
            if identities.changed().await.is_err() {
                break;
            }
        }
    });

    // Refetch mounted views as soon as one of their classes goes stale.
    let mut invalidations = state.cache.subscribe_invalidations();
    let refresh_state = state.clone();
    tokio::spawn(async move {
        loop {
            match invalidations.recv().await {
                Ok(class) => refresh_state.refresh(Some(&*class)).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation stream lagged, refreshing all views");
                    refresh_state.refresh(None).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let follower = state.manager.follow(state.session.subscribe());

    match config.session_token.as_deref() {
        Some(token) => {
            let identity = state.session.login(token)?;
            info!(subject_id = %identity.subject_id, role = ?identity.role, "logged in");
        }
        None => warn!("SYNC_TOKEN not set, staying offline until a session exists"),
    }

    shutdown_signal().await;

    if let Some(identity) = state.session.current() {
        info!(subject_id = %identity.subject_id, "logging out");
    }
    state.session.logout();
    state.manager.shutdown();
    follower.abort();
    wait_idle(state.manager.subscribe_state()).await;
    info!("push channel closed");

    Ok(())
}

async fn wait_idle(mut state: watch::Receiver<ChannelState>) {
    let _ = state.wait_for(|s| *s == ChannelState::Idle).await;
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
