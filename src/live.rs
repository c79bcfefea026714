//! Live preview channel
//!
//! A WebSocket side channel scoped to one template. Local value changes from
//! the playground are published as `update_widget` frames; `widget_update`
//! frames from the device side are applied back onto the scene.
//!
//! The connection is opened lazily once the scene holds a widget and is
//! re-established with exponential backoff after an unexpected disconnect.
//! Each (re)connect goes through the same sequence:
//!
//! ```text
//! disconnected --> connecting --(join_template sent)--> joined
//!       ^                                                 |
//!       +--------------(drop / error, backoff)------------+
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::codec::WidgetValue;
use crate::config::PlaygroundConfig;
use crate::controller::{Playground, SceneUpdate, ValueOrigin};
use crate::error::Result;
use crate::session::Session;

/// Device pin index sent for widgets without a bound pin
pub const NO_PIN: u32 = 0;

/// Connection status for UI display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Joined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinTemplate {
    #[serde(rename = "templateId")]
    pub template_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundUpdate {
    pub token: String,
    #[serde(rename = "V_P")]
    pub device_pin: u32,
    pub data: WidgetValue,
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(rename = "widgetId")]
    pub widget_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Frames sent to the live service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinTemplate(JoinTemplate),
    UpdateWidget(OutboundUpdate),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundUpdate {
    #[serde(rename = "widgetId")]
    pub widget_id: String,
    #[serde(default)]
    pub data: WidgetValue,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateAck {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "widgetId", default)]
    pub widget_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Frames received from the live service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    WidgetUpdate(InboundUpdate),
    WidgetUpdated(UpdateAck),
}

/// Exponential reconnect delay, capped
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Handle to the background live channel task
pub struct LiveChannel {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LiveChannel {
    /// Starts the channel for `playground`'s template
    pub fn spawn(config: &PlaygroundConfig, session: Session, playground: Playground) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            url: config.socket_url.clone(),
            backoff: Backoff::new(config.reconnect_initial_delay, config.reconnect_max_delay),
            updates: playground.subscribe(),
            playground,
            session,
            phase: Phase::Disconnected,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        Self { state, shutdown, task }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Closes the socket and stops reconnecting
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "live channel task ended abnormally");
        }
    }
}

enum Exit {
    Shutdown,
    Dropped,
}

struct Worker {
    playground: Playground,
    session: Session,
    url: String,
    backoff: Backoff,
    phase: Phase,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    updates: broadcast::Receiver<SceneUpdate>,
}

impl Worker {
    async fn run(mut self) {
        while self.wait_for_widgets().await {
            self.enter(Phase::Connecting);
            let connected = tokio::select! {
                res = tokio_tungstenite::connect_async(self.url.as_str()) => res,
                _ = stopped(&mut self.shutdown) => break,
            };

            let exit = match connected {
                Ok((socket, _)) => self.drive(socket).await,
                Err(err) => {
                    warn!(url = %self.url, error = %err, "live channel connect failed");
                    self.state.send_replace(ConnectionState::Error);
                    Exit::Dropped
                }
            };

            self.enter(Phase::Disconnected);
            if matches!(exit, Exit::Shutdown) || !self.pause().await {
                break;
            }
        }

        self.enter(Phase::Disconnected);
        self.state.send_replace(ConnectionState::Disconnected);
        info!(template_id = %self.playground.template_id(), "live channel stopped");
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        debug!(from = ?self.phase, to = ?phase, "live channel phase");
        self.phase = phase;
        let was_connected = *self.state.borrow() == ConnectionState::Connected;
        match phase {
            Phase::Joined => {
                self.state.send_replace(ConnectionState::Connected);
            }
            Phase::Disconnected if was_connected => {
                self.state.send_replace(ConnectionState::Disconnected);
            }
            _ => {}
        }
    }

    /// Blocks until the scene is non-empty; `false` on shutdown
    async fn wait_for_widgets(&mut self) -> bool {
        while self.playground.is_empty() {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => return false,
                update = self.updates.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = update {
                        return false;
                    }
                }
            }
        }
        !*self.shutdown.borrow()
    }

    /// Waits out the backoff delay; `false` on shutdown
    async fn pause(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(?delay, "live channel reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stopped(&mut self.shutdown) => false,
        }
    }

    async fn drive<S>(&mut self, socket: S) -> Exit
    where
        S: Sink<Message, Error = tungstenite::Error>
            + futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>>
            + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        let join = ClientEvent::JoinTemplate(JoinTemplate {
            template_id: self.playground.template_id().to_string(),
            token: self.session.token.clone(),
        });
        if let Err(err) = send(&mut sink, &join).await {
            warn!(error = %err, "live channel join failed");
            self.state.send_replace(ConnectionState::Error);
            return Exit::Dropped;
        }
        self.enter(Phase::Joined);
        self.backoff.reset();
        info!(template_id = %self.playground.template_id(), "live channel joined");

        loop {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("live channel closed by server");
                        return Exit::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "live channel read failed");
                        self.state.send_replace(ConnectionState::Error);
                        return Exit::Dropped;
                    }
                },
                update = self.updates.recv() => match update {
                    Ok(SceneUpdate::ValueChanged { instance_id, value, origin: ValueOrigin::Local }) => {
                        let event = self.outbound_update(instance_id, value);
                        if let Err(err) = send(&mut sink, &event).await {
                            warn!(error = %err, "live channel write failed");
                            self.state.send_replace(ConnectionState::Error);
                            return Exit::Dropped;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live channel fell behind scene updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Exit::Shutdown,
                },
            }
        }
    }

    fn outbound_update(&self, instance_id: String, value: WidgetValue) -> ClientEvent {
        ClientEvent::UpdateWidget(OutboundUpdate {
            token: self.session.token.clone(),
            device_pin: self.playground.device_pin(&instance_id).unwrap_or(NO_PIN),
            data: value,
            template_id: self.playground.template_id().to_string(),
            widget_id: instance_id,
            timestamp: now_millis(),
        })
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::WidgetUpdate(update)) => {
                self.playground.apply_remote_value(&update.widget_id, update.data);
            }
            Ok(ServerEvent::WidgetUpdated(ack)) if ack.success => {
                debug!(widget_id = ?ack.widget_id, topic = ?ack.topic, "live update acknowledged");
            }
            Ok(ServerEvent::WidgetUpdated(ack)) => {
                warn!(widget_id = ?ack.widget_id, error = ?ack.error, "live update rejected");
            }
            Err(err) => debug!(error = %err, "ignoring live frame"),
        }
    }
}

/// Resolves once shutdown is requested or the handle is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn send<S>(sink: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExportRecord, Position};
    use crate::testing::{FakeGateway, definition, pin};
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Clone)]
    struct SocketState {
        seen: mpsc::UnboundedSender<Value>,
        outbound: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
        drop_first: Arc<AtomicBool>,
    }

    async fn socket_handler(ws: WebSocketUpgrade, State(state): State<SocketState>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| serve_socket(socket, state))
    }

    async fn serve_socket(mut socket: WebSocket, state: SocketState) {
        if state.drop_first.swap(false, Ordering::SeqCst) {
            if let Some(Ok(WsMessage::Text(text))) = socket.recv().await
                && let Ok(frame) = serde_json::from_str::<Value>(&text)
            {
                let _ = state.seen.send(frame);
            }
            return;
        }

        let (mut sender, mut receiver) = socket.split();
        let outbound = state.outbound.lock().take();
        if let Some(mut outbound) = outbound {
            tokio::spawn(async move {
                while let Some(text) = outbound.recv().await {
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            });
        }

        while let Some(Ok(msg)) = receiver.next().await {
            if let WsMessage::Text(text) = msg
                && let Ok(frame) = serde_json::from_str::<Value>(&text)
            {
                let _ = state.seen.send(frame);
            }
        }
    }

    struct TestSocket {
        url: String,
        seen: mpsc::UnboundedReceiver<Value>,
        outbound: mpsc::UnboundedSender<String>,
    }

    async fn start_socket_server(drop_first: bool) -> TestSocket {
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let state = SocketState {
            seen: seen_tx,
            outbound: Arc::new(Mutex::new(Some(outbound_rx))),
            drop_first: Arc::new(AtomicBool::new(drop_first)),
        };
        let app = Router::new().route("/live", get(socket_handler)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestSocket {
            url: format!("ws://127.0.0.1:{port}/live"),
            seen,
            outbound,
        }
    }

    async fn bound_slider_playground() -> Playground {
        let gateway = Arc::new(FakeGateway::with_widgets(vec![definition("sl", "slider", 1)]));
        gateway.set_pins(vec![pin("p7", 7, true)]);
        gateway.set_widget_list(vec![ExportRecord {
            instance_id: "w1".into(),
            widget_id: "sl".into(),
            pin_config: vec!["p7".into()],
            position: Position::new(0.0, 0.0),
        }]);
        Playground::open(&PlaygroundConfig::default(), gateway, "t1").await.unwrap()
    }

    fn live_config(url: &str) -> PlaygroundConfig {
        PlaygroundConfig::default()
            .socket_url(url)
            .reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
    }

    #[test]
    fn test_client_frames_shape() {
        let join = ClientEvent::JoinTemplate(JoinTemplate {
            template_id: "t1".into(),
            token: "tok".into(),
        });
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"event": "join_template", "data": {"templateId": "t1", "token": "tok"}})
        );

        let update = ClientEvent::UpdateWidget(OutboundUpdate {
            token: "tok".into(),
            device_pin: NO_PIN,
            data: WidgetValue::Bool(true),
            template_id: "t1".into(),
            widget_id: "w1".into(),
            timestamp: 1,
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["event"], "update_widget");
        assert_eq!(value["data"]["V_P"], 0);
        assert_eq!(value["data"]["data"], true);
        assert_eq!(value["data"]["widgetId"], "w1");
    }

    #[test]
    fn test_server_frames_decode() {
        let update: ServerEvent =
            serde_json::from_str(r#"{"event":"widget_update","data":{"widgetId":"w1","data":42}}"#).unwrap();
        assert_eq!(
            update,
            ServerEvent::WidgetUpdate(InboundUpdate {
                widget_id: "w1".into(),
                data: WidgetValue::Number(42.0),
            })
        );

        let ack: ServerEvent = serde_json::from_str(
            r#"{"event":"widget_updated","data":{"success":false,"widgetId":"w1","topic":"t1/V7","error":"offline"}}"#,
        )
        .unwrap();
        assert!(matches!(ack, ServerEvent::WidgetUpdated(UpdateAck { success: false, ref error, .. }) if error.as_deref() == Some("offline")));

        assert!(serde_json::from_str::<ServerEvent>(r#"{"event":"presence","data":{}}"#).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(2));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2)
            ]
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_stopped_on_request_or_dropped_handle() {
        let (tx, mut rx) = watch::channel(false);
        assert!(timeout(Duration::from_millis(50), stopped(&mut rx)).await.is_err());
        tx.send_replace(true);
        timeout(WAIT, stopped(&mut rx)).await.unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        timeout(WAIT, stopped(&mut rx)).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_publish_and_apply_remote() {
        let mut server = start_socket_server(false).await;
        let pg = bound_slider_playground().await;
        let live = LiveChannel::spawn(&live_config(&server.url), Session::new("tok"), pg.clone());

        let join = timeout(WAIT, server.seen.recv()).await.unwrap().unwrap();
        assert_eq!(join["event"], "join_template");
        assert_eq!(join["data"], json!({"templateId": "t1", "token": "tok"}));

        let mut state = live.state();
        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        pg.set_value("w1", WidgetValue::Number(12.0));
        let update = timeout(WAIT, server.seen.recv()).await.unwrap().unwrap();
        assert_eq!(update["event"], "update_widget");
        assert_eq!(update["data"]["V_P"], 7);
        assert_eq!(update["data"]["data"], 12.0);
        assert_eq!(update["data"]["widgetId"], "w1");
        assert_eq!(update["data"]["templateId"], "t1");

        let mut updates = pg.subscribe();
        server
            .outbound
            .send(json!({"event": "widget_update", "data": {"widgetId": "w1", "data": 80}}).to_string())
            .unwrap();
        let applied = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert!(matches!(applied, SceneUpdate::ValueChanged { origin: ValueOrigin::Remote, .. }));
        assert_eq!(pg.instance("w1").unwrap().value, WidgetValue::Number(80.0));

        live.shutdown().await;
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connects_only_once_scene_has_widgets() {
        let mut server = start_socket_server(false).await;
        let gateway = Arc::new(FakeGateway::with_widgets(vec![definition("sw", "switch", 0)]));
        let pg = Playground::open(&PlaygroundConfig::default(), gateway, "t1").await.unwrap();
        let live = LiveChannel::spawn(&live_config(&server.url), Session::new("tok"), pg.clone());

        assert!(timeout(Duration::from_millis(200), server.seen.recv()).await.is_err());
        assert_eq!(live.connection_state(), ConnectionState::Disconnected);

        pg.add_widget("sw", None).unwrap();
        let join = timeout(WAIT, server.seen.recv()).await.unwrap().unwrap();
        assert_eq!(join["event"], "join_template");

        live.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_rejoins() {
        let mut server = start_socket_server(true).await;
        let pg = bound_slider_playground().await;
        let live = LiveChannel::spawn(&live_config(&server.url), Session::new("tok"), pg);

        for _ in 0..2 {
            let join = timeout(WAIT, server.seen.recv()).await.unwrap().unwrap();
            assert_eq!(join["event"], "join_template");
        }

        live.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_error() {
        let pg = bound_slider_playground().await;
        let live = LiveChannel::spawn(&live_config("ws://127.0.0.1:9/live"), Session::new("tok"), pg);

        let mut state = live.state();
        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Error))
            .await
            .unwrap()
            .unwrap();
        live.shutdown().await;
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }
}
