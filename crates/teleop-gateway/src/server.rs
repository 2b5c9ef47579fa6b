//! [`GatewayServer`] – WebSocket front door for operators, admins and
//! robots.
//!
//! Listens on `0.0.0.0:8080` by default ([`GatewayServer::with_port`]).
//!
//! * WebSocket upgrades → request/response per [`crate::protocol`], plus a
//!   downstream push of session transitions and system alerts.
//! * Any other HTTP request → `200 OK` with a small JSON health body.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use teleop_middleware::{EventBus, Topic, TopicReceiver};
use teleop_types::{Event, TeleopError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::Dispatcher;

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 8080;

const HEALTH_BODY: &str = r#"{"status":"ok","service":"teleop-gateway"}"#;

pub struct GatewayServer {
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
    port: u16,
}

impl GatewayServer {
    pub fn new(dispatcher: Dispatcher, bus: Arc<EventBus>) -> Self {
        Self {
            dispatcher,
            bus,
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the configured port and serve forever.
    ///
    /// # Errors
    ///
    /// [`TeleopError::Transport`] when the listener cannot bind.
    pub async fn run(self) -> Result<(), TeleopError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    pub async fn bind(&self) -> Result<TcpListener, TeleopError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        TcpListener::bind(addr)
            .await
            .map_err(|e| TeleopError::Transport {
                channel: "gateway".to_string(),
                details: format!("bind error on {addr}: {e}"),
            })
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "teleop gateway listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let dispatcher = self.dispatcher.clone();
                    let bus = Arc::clone(&self.bus);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, dispatcher, bus).await {
                            debug!(%peer, error = %e, "client connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
) -> Result<(), TeleopError> {
    // `peek` leaves the request in the socket for the WebSocket handshake.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| transport_error(peer, format!("peek: {e}")))?;

    if is_websocket_upgrade(&buf[..n]) {
        handle_ws(stream, peer, dispatcher, bus).await
    } else {
        serve_health(stream, peer).await
    }
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

async fn serve_health(mut stream: TcpStream, peer: SocketAddr) -> Result<(), TeleopError> {
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        HEALTH_BODY.len(),
        HEALTH_BODY
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| transport_error(peer, format!("http write: {e}")))
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
) -> Result<(), TeleopError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| transport_error(peer, format!("handshake: {e}")))?;
    info!(%peer, "gateway client connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut sessions = bus.subscribe_to(Topic::Sessions);
    let mut alerts = bus.subscribe_to(Topic::SystemAlerts);

    loop {
        let outbound = tokio::select! {
            pushed = next_event(&mut sessions) => match pushed {
                Some(event) => serde_json::to_string(&event).ok(),
                None => break,
            },
            pushed = next_event(&mut alerts) => match pushed {
                Some(event) => serde_json::to_string(&event).ok(),
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => respond(&dispatcher, text.to_string(), peer).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "websocket read error");
                    break;
                }
                _ => None,
            },
        };
        if let Some(json) = outbound
            && ws_tx.send(Message::Text(json.into())).await.is_err()
        {
            break;
        }
    }

    info!(%peer, "gateway client disconnected");
    Ok(())
}

/// Run one request on the blocking pool; store calls hit SQLite.
async fn respond(dispatcher: &Dispatcher, text: String, peer: SocketAddr) -> Option<String> {
    let dispatcher = dispatcher.clone();
    match tokio::task::spawn_blocking(move || dispatcher.handle_text(&text)).await {
        Ok(response) => serde_json::to_string(&response).ok(),
        Err(e) => {
            warn!(%peer, error = %e, "request handler failed");
            None
        }
    }
}

/// Next event for a client, skipping over lag. `None` once the bus is gone.
async fn next_event(rx: &mut TopicReceiver) -> Option<Event> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(missed)) => {
                warn!(topic = ?rx.topic(), missed, "gateway client lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

fn transport_error(peer: SocketAddr, details: String) -> TeleopError {
    TeleopError::Transport {
        channel: format!("gateway client {peer}"),
        details,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use teleop_middleware::{BusNotifier, Notifier};
    use teleop_store::{DEFAULT_OFFLINE_TIMEOUT, Database, Stores, SystemClock};
    use teleop_types::{Notice, NoticeLevel};
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::connect_async;

    use super::*;
    use crate::protocol::Response;

    fn server(bus: &Arc<EventBus>) -> GatewayServer {
        let stores = Stores::with_parts(
            Database::open_in_memory().unwrap(),
            Arc::new(SystemClock),
            DEFAULT_OFFLINE_TIMEOUT,
            Some(Arc::clone(bus)),
        );
        stores.telemetry.register("R1", None).unwrap();
        GatewayServer::new(Dispatcher::new(stores), Arc::clone(bus))
    }

    async fn start(bus: &Arc<EventBus>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server(bus).serve(listener));
        addr
    }

    #[test]
    fn default_port_is_8080() {
        let bus = Arc::new(EventBus::default());
        assert_eq!(server(&bus).port(), DEFAULT_PORT);
        assert_eq!(server(&bus).with_port(9999).port(), 9999);
    }

    #[tokio::test]
    async fn requests_run_on_the_blocking_pool() {
        let bus = Arc::new(EventBus::default());
        let dispatcher = server(&bus).dispatcher;
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let json = respond(
            &dispatcher,
            r#"{"op":"create_session","robot_id":"R1","operator_id":3}"#.to_string(),
            peer,
        )
        .await
        .unwrap();
        let response: Response = serde_json::from_str(&json).unwrap();
        assert!(response.ok, "{response:?}");
        assert!(dispatcher.stores().sessions.current("R1").unwrap().is_some());

        let json = respond(&dispatcher, "garbage".to_string(), peer).await.unwrap();
        assert!(json.contains("BAD_REQUEST"));
    }

    #[test]
    fn upgrade_detection() {
        assert!(is_websocket_upgrade(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n"
        ));
        assert!(is_websocket_upgrade(b"GET / HTTP/1.1\r\nupgrade: WebSocket\r\n\r\n"));
        assert!(!is_websocket_upgrade(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[tokio::test]
    async fn plain_http_gets_health_body() {
        let bus = Arc::new(EventBus::default());
        let addr = start(&bus).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.ends_with(HEALTH_BODY));
    }

    #[tokio::test]
    async fn websocket_request_response_and_push() {
        let bus = Arc::new(EventBus::default());
        let addr = start(&bus).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        ws.send(Message::Text(
            r#"{"op":"create_session","robot_id":"R1","operator_id":1}"#.into(),
        ))
        .await
        .unwrap();

        // The transition push and the response race; collect both.
        let mut saw_response = false;
        let mut saw_event = false;
        while !(saw_response && saw_event) {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("gateway answered")
                .unwrap()
                .unwrap();
            let Message::Text(text) = msg else { continue };
            if let Ok(resp) = serde_json::from_str::<Response>(text.as_str()) {
                assert!(resp.ok, "{resp:?}");
                saw_response = true;
            } else {
                let event: Event = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(event.source, "teleop-store::sessions");
                saw_event = true;
            }
        }

        BusNotifier::new(Arc::clone(&bus)).notify(Notice::new(
            NoticeLevel::Warning,
            Some("R1"),
            "Robot is rebooting",
        ));
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(msg.to_text().unwrap().contains("Robot is rebooting"));
    }
}
