use crate::env::Env;
use crate::http::{
    build_cors, connect_session, deploy_sandbox, extend_session, get_stats, get_version,
    list_sessions, session_time_left, share_session, stop_session,
};
use crate::reaper::OrphanReaper;
use crate::registry::TunnelRegistry;
use crate::state::AppState;
use crate::store::SessionStore;
use crate::supervisor::DisconnectSupervisor;
use crate::workloads::{KubeApiClient, WorkloadClient};
use crate::ws::{ws_share_handler, ws_tunnel_handler};
use axum::Router;
use axum::routing::{delete, get, post};
use log::{info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;

pub async fn start(config: Env) -> anyhow::Result<()> {
    info!("running broker on {} mode", config.mode);

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let store = SessionStore::connect(
        &config.redis_url(),
        config.session_timeout(),
        config.extension_policy(),
    )
    .await?;
    info!("connected to session store");

    let workloads: Arc<dyn WorkloadClient> = Arc::new(KubeApiClient::new(
        config.kube_api_url.clone(),
        &config.kube_token_path,
        &config.kube_ca_path,
        config.kube_namespace.clone(),
        config.sandbox_label.clone(),
        config.sandbox_image.clone(),
        config.sandbox_subdomain.clone(),
    )?);
    info!("workload client ready");

    let registry = Arc::new(TunnelRegistry::new());
    let supervisor = DisconnectSupervisor::new(
        store.clone(),
        registry.clone(),
        workloads.clone(),
        config.reconnect_grace(),
    );
    let reaper = OrphanReaper::new(
        store.clone(),
        workloads.clone(),
        config.reaper_interval(),
        config.reaper_grace(),
    );

    let state = AppState {
        env: Arc::new(config),
        store,
        registry,
        supervisor,
        workloads,
    };
    info!("state ready");

    let reaper_task = reaper.spawn(shutdown_tx.subscribe());
    let http_task = start_http_server(state, shutdown_tx.subscribe());

    let shutdown_signal = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {}", err);
        } else {
            info!("ctrl+c pressed, shutting down");
        }
    };

    tokio::select! {
        _ = http_task => warn!("http task ended"),
        _ = reaper_task => warn!("reaper task ended"),
        _ = shutdown_signal => info!("shutdown signal received"),
    }

    info!("shutting down broker");
    let _ = shutdown_tx.send(());

    Ok(())
}

fn start_http_server(
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    info!("starting http server");

    let host = format!("{}:{}", state.env.host, state.env.port);

    tokio::spawn(async move {
        let cors = build_cors(&state);

        let app = Router::new()
            .route("/version", get(get_version))
            .route("/stats", get(get_stats))
            .route("/websocket-tunnel", get(ws_tunnel_handler))
            .route("/websocket-tunnel/share", get(ws_share_handler))
            .route("/sandboxes", post(deploy_sandbox))
            .route("/sessions", get(list_sessions))
            .route("/sessions/{id}/connect", get(connect_session))
            .route("/sessions/{id}/share", get(share_session))
            .route("/sessions/{id}/stop", delete(stop_session))
            .route("/sessions/{id}/extend", post(extend_session))
            .route("/sessions/{id}/time-left", get(session_time_left))
            .layer(cors)
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(host).await.unwrap();
        info!("listening on: {}", listener.local_addr().unwrap());

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .unwrap();
    })
}
