use crate::error::BrokerError;
use crate::guacd::{self, InstructionReader, InstructionWriter};
use crate::handshake::{self, ConnectionConfig};
use crate::state::AppState;
use crate::tunnel::Tunnel;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Floor applied when a connect-path write would otherwise leave the
/// session with (nearly) no time on the clock.
const MIN_CONNECT_TTL: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
pub(crate) struct TunnelQuery {
    uuid: String,
}

pub(crate) async fn ws_tunnel_handler(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.uuid, false))
}

pub(crate) async fn ws_share_handler(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.uuid, true))
}

async fn handle_socket(socket: WebSocket, state: AppState, external_id: String, share_join: bool) {
    let established = if share_join {
        establish_share(&state, &external_id).await
    } else {
        establish(&state, &external_id).await
    };

    match established {
        Ok(established) => pump(socket, state, established).await,
        Err(err) => {
            warn!("failed to establish tunnel for {external_id}: {err}");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1011,
                    reason: err.to_string().into(),
                })))
                .await;
        }
    }
}

/// A tunnel the handshake has produced, ready to be pumped.
struct Established {
    tunnel: Arc<Tunnel>,
    /// Id handed to the disconnect supervisor once the socket closes: the
    /// session's external id, or the viewer's fresh id on a share join.
    session_id: String,
    reader: InstructionReader<OwnedReadHalf>,
    writer: InstructionWriter<OwnedWriteHalf>,
}

/// The connect path: resolves the stored session, clears a pending
/// reconnect marker, performs the gateway handshake and registers the
/// resulting tunnel.
async fn establish(state: &AppState, external_id: &str) -> Result<Established, BrokerError> {
    let mut session = state.store.get(external_id).await?;
    session.backfill_lifetimes(state.store.default_timeout());

    let reconnected = state.store.clear_reconnect(external_id).await?;
    if reconnected {
        session.disconnection_count = 0;
        let ttl = state
            .store
            .preserved_ttl(external_id, &session)
            .await?
            .max(MIN_CONNECT_TTL);
        state.store.put(external_id, &session, ttl).await?;
        info!(
            "session {external_id} reconnected, cleared reconnection window ({}s left)",
            ttl.as_secs()
        );
    } else {
        let ttl = session.remaining().max(MIN_CONNECT_TTL);
        state.store.put(external_id, &session, ttl).await?;
    }

    // the deploy-time snapshot wins over whatever the record carries
    let params = state
        .registry
        .params(external_id)
        .unwrap_or_else(|| session.connection_params.clone());

    let config = ConnectionConfig::from_params(&params);
    let (reader, writer, tunnel_id) = open_gateway(state, &config, session.share).await?;

    let tunnel = Tunnel::new(tunnel_id.clone(), external_id);
    state.registry.add(tunnel_id.clone(), tunnel.clone());

    // a reconnection leaves the previous handshake's entry behind; retire it
    if let Some(previous) = session.tunnel_id.replace(tunnel_id.clone()) {
        if previous != tunnel_id {
            if let Some(old) = state.registry.get(&previous) {
                old.close();
            }
            state.registry.delete(&previous);
            state.registry.delete_params(&previous);
        }
    }

    state.store.put_preserving_ttl(external_id, &session).await?;
    state.registry.put_params(tunnel_id, params);

    Ok(Established {
        tunnel,
        session_id: external_id.to_string(),
        reader,
        writer,
    })
}

/// The share path: joins a second viewer onto an existing tunnel. A failed
/// join leaves the owner's tunnel untouched.
async fn establish_share(state: &AppState, external_id: &str) -> Result<Established, BrokerError> {
    let session = state.store.get(external_id).await?;
    if !session.share {
        return Err(BrokerError::Forbidden(
            "session sharing is not enabled".to_string(),
        ));
    }

    let owner_tunnel_id = session.tunnel_id.ok_or(BrokerError::ShareUnavailable)?;
    if state.registry.get(&owner_tunnel_id).is_none() {
        return Err(BrokerError::ShareUnavailable);
    }

    let mut params = state
        .registry
        .params(external_id)
        .ok_or(BrokerError::ShareUnavailable)?;

    // the viewer gets its own identity; everything else is the owner's
    let viewer_id = Uuid::new_v4().to_string();
    params.insert("uuid".to_string(), viewer_id.clone());

    let mut config = ConnectionConfig::from_params(&params);
    config.join_connection_id = Some(owner_tunnel_id.clone());

    let (reader, writer, tunnel_id) = open_gateway(state, &config, true).await?;

    let tunnel = Tunnel::new(tunnel_id.clone(), viewer_id.clone());
    state.registry.add(tunnel_id.clone(), tunnel.clone());
    state.registry.put_params(tunnel_id, params);

    info!("viewer {viewer_id} joined shared session {external_id}");

    Ok(Established {
        tunnel,
        session_id: viewer_id,
        reader,
        writer,
    })
}

async fn open_gateway(
    state: &AppState,
    config: &ConnectionConfig,
    share: bool,
) -> Result<
    (
        InstructionReader<OwnedReadHalf>,
        InstructionWriter<OwnedWriteHalf>,
        String,
    ),
    BrokerError,
> {
    let env = &state.env;
    let (mut reader, mut writer) = guacd::dial(
        &env.guacd_address,
        env.dial_timeout(),
        env.socket_timeout(),
    )
    .await?;

    debug!("starting handshake with config {:?}", config.sanitized(share));

    let tunnel_id =
        handshake::handshake(&mut reader, &mut writer, config, env.handshake_timeout()).await?;
    info!("gateway assigned tunnel {tunnel_id}");

    Ok((reader, writer, tunnel_id))
}

/// Runs the two byte pumps until either side goes away, then hands the
/// close to the disconnect supervisor. The bounded channel between the
/// gateway reader and the websocket writer is the only buffering: a slow
/// browser stalls the gateway read instead of growing memory.
async fn pump(socket: WebSocket, state: AppState, established: Established) {
    let Established {
        tunnel,
        session_id,
        mut reader,
        writer,
    } = established;
    let tunnel_id = tunnel.tunnel_id().to_string();

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(256);

    let write_task = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(err) = ws_tx.send(Message::Binary(chunk)).await {
                warn!("failed to send frame to browser: {err}");
                break;
            }
        }
    });

    // gateway -> browser
    let leftover = reader.take_buffered();
    let mut gateway_rx = reader.into_inner();
    let gateway_task = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            if !leftover.is_empty() && tx.send(leftover).await.is_err() {
                tunnel.close();
                return;
            }

            let mut buf = vec![0u8; 8 * 1024];
            loop {
                tokio::select! {
                    read = gateway_rx.read(&mut buf) => match read {
                        Ok(0) => {
                            debug!("gateway closed the stream");
                            break;
                        }
                        Ok(n) => {
                            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!("gateway read failed: {err}");
                            break;
                        }
                    },
                    _ = tunnel.wait_closed() => break,
                }
            }
            tunnel.close();
        })
    };

    // browser -> gateway, on this task
    let mut gateway_tx = writer.into_inner();
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("websocket read failed: {err}");
                        break;
                    }
                };
                match msg {
                    Message::Binary(data) => {
                        if let Err(err) = gateway_tx.write_all(&data).await {
                            warn!("gateway write failed: {err}");
                            break;
                        }
                    }
                    Message::Text(text) => {
                        if let Err(err) = gateway_tx.write_all(text.as_bytes()).await {
                            warn!("gateway write failed: {err}");
                            break;
                        }
                    }
                    Message::Close(reason) => {
                        debug!("browser closed websocket: {reason:?}");
                        break;
                    }
                    _ => {}
                }
            }
            _ = tunnel.wait_closed() => break,
        }
    }

    tunnel.close();
    let _ = gateway_task.await;
    write_task.abort();

    info!("tunnel {tunnel_id} for {session_id} shut down");
    state
        .supervisor
        .on_disconnect(&session_id, Some(&tunnel_id))
        .await;
}
