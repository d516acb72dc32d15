use crate::webserver::adaptive::AdaptiveSession;
use crate::webserver::messages::{encode, encode_into, ClientRequest, ServerMessage};
use crate::Daemon;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use jt_mq::MqError;
use jt_sampler::list_interfaces;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often a session drains its subscribed tiers. Half the fastest
/// tier interval, so tier 1 never backs up under a healthy link.
const DRAIN_INTERVAL: Duration = Duration::from_millis(5);

/// The controller's observation window.
const ADAPT_INTERVAL: Duration = Duration::from_secs(5);

pub fn websocket_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(Extension(daemon))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(daemon): Extension<Arc<Daemon>>,
) -> impl IntoResponse {
    info!("WS Upgrade Called");
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, daemon).await;
    })
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match encode(message) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!("message not sent: {err}");
            true
        }
    }
}

/// The connect-time burst telling a new viewer what it is looking at:
/// the selectable interfaces, the active interface, and the period.
async fn send_hello(socket: &mut WebSocket, daemon: &Daemon) -> bool {
    let ifaces = list_interfaces()
        .into_iter()
        .filter(|iface| daemon.config.interface_allowed(iface))
        .collect();
    send(socket, &ServerMessage::IfaceList { ifaces }).await
        && send(
            socket,
            &ServerMessage::Iface {
                iface: daemon.sampler.interface(),
            },
        )
        .await
        && send(
            socket,
            &ServerMessage::SamplePeriod {
                period_us: daemon.sampler.sample_period_us(),
            },
        )
        .await
}

/// Forwards everything queued on the session's tiers, slowest tier
/// first so control messages precede the stats they describe.
/// Returns false when the socket is gone.
async fn drain_tiers(socket: &mut WebSocket, daemon: &Daemon, session: &AdaptiveSession) -> bool {
    for (tier, id) in session.subscribed() {
        loop {
            match daemon.queues.queue(tier).consume(id) {
                Ok(payload) => {
                    if socket.send(Message::Text(payload.0)).await.is_err() {
                        return false;
                    }
                }
                Err(MqError::Empty) => break,
                Err(err) => {
                    warn!("tier {tier} consume failed: {err}");
                    break;
                }
            }
        }
    }
    true
}

/// Applies one client request. Interface and period changes are
/// announced on the control tier so every viewer stays in sync.
fn handle_request(daemon: &Daemon, request: ClientRequest) {
    match request {
        ClientRequest::SelectIface { iface } => {
            if !daemon.config.interface_allowed(&iface) {
                warn!("client asked for disallowed interface {iface}");
                return;
            }
            if !list_interfaces().contains(&iface) {
                warn!("client asked for missing interface {iface}");
                return;
            }
            daemon.sampler.switch_interface(&iface);
            broadcast(daemon, &ServerMessage::Iface { iface });
        }
        ClientRequest::SetSamplePeriod { period_us } => {
            let applied = daemon.sampler.set_sample_period(period_us);
            broadcast(daemon, &ServerMessage::SamplePeriod { period_us: applied });
        }
    }
}

/// Publishes a control message (interval 0 routes to tier 5, which
/// every session holds).
fn broadcast(daemon: &Daemon, message: &ServerMessage) {
    match daemon.queues.produce_with(0, |slot| encode_into(message, slot)) {
        Ok(_) | Err(MqError::NoConsumers) => {}
        Err(err) => debug!("control message not published: {err}"),
    }
}

async fn handle_socket(mut socket: WebSocket, daemon: Arc<Daemon>) {
    info!("Websocket connected");

    let mut session = match AdaptiveSession::new(&daemon.queues) {
        Ok(session) => session,
        Err(err) => {
            warn!("refusing websocket session: {err}");
            let refusal = ServerMessage::Error {
                reason: err.to_string(),
            };
            let _ = send(&mut socket, &refusal).await;
            return;
        }
    };
    if !send_hello(&mut socket, &daemon).await {
        session.unsubscribe_all(&daemon.queues);
        return;
    }

    let mut drain = tokio::time::interval(DRAIN_INTERVAL);
    drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut adapt = tokio::time::interval(ADAPT_INTERVAL);
    adapt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(msg)) => {
                        if let Ok(text) = msg.to_text() {
                            match serde_json::from_str::<ClientRequest>(text) {
                                Ok(request) => handle_request(&daemon, request),
                                Err(err) => debug!("unparseable client request: {err}"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Error receiving websocket message: {:?}", e);
                        break;
                    }
                    None => {
                        break;
                    }
                }
            }
            _ = drain.tick() => {
                if !drain_tiers(&mut socket, &daemon, &session).await {
                    break;
                }
            }
            _ = adapt.tick() => {
                if let Some(tier) = session.adapt(&daemon.queues) {
                    let notice = ServerMessage::TierChange {
                        min_interval_ms: tier.min_interval_ms(),
                    };
                    if !send(&mut socket, &notice).await {
                        break;
                    }
                }
            }
        }
    }

    session.unsubscribe_all(&daemon.queues);
    info!("Websocket disconnected");
}
