//! Canvas host
//!
//! Serves an editor page and speaks a JSON protocol over WebSocket so a
//! browser front-end can drive a [`Playground`]. The page itself is a thin
//! shell; scripts and styles come from the static directory.
//!
//! Client messages (`type` tag): `add`, `drag_start`, `drag_move`,
//! `drag_end`, `click`, `set_value`, `delete`, `save_config`,
//! `reset_config`, `save`.
//!
//! Server messages: `init`, `update`, `removed`, `capacity`, `dialog`,
//! `notice`.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{Html, IntoResponse},
    routing::get,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::codec::{WidgetType, WidgetValue};
use crate::config::PlaygroundConfig;
use crate::controller::{ConfigDialog, Playground, SceneUpdate};
use crate::error::Error;
use crate::model::Position;
use crate::pins::PinCapacity;
use crate::scene::WidgetInstance;

const DEFAULT_BODY: &str = r#"<aside id="catalog"></aside>
<main id="canvas"></main>
<dialog id="config"></dialog>"#;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Add {
        widget_id: String,
        #[serde(default)]
        position: Option<Position>,
    },
    DragStart {
        instance_id: String,
    },
    DragMove {
        instance_id: String,
        dx: f64,
        dy: f64,
    },
    DragEnd {
        instance_id: String,
        dx: f64,
        dy: f64,
    },
    Click {
        instance_id: String,
    },
    SetValue {
        instance_id: String,
        value: WidgetValue,
    },
    Delete {
        instance_id: String,
    },
    SaveConfig {
        dialog: ConfigDialog,
    },
    ResetConfig {
        dialog: ConfigDialog,
    },
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
struct CatalogEntry {
    id: String,
    name: String,
    kind: WidgetType,
    pin_required: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Init {
        template_id: String,
        template_name: String,
        instances: Vec<WidgetInstance>,
        catalog: Vec<CatalogEntry>,
        capacity: PinCapacity,
    },
    Update {
        instance: WidgetInstance,
    },
    Removed {
        instance_id: String,
    },
    Capacity {
        free: usize,
        total: usize,
    },
    Dialog {
        dialog: ConfigDialog,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
}

impl ServerMessage {
    fn info(message: impl Into<String>) -> Self {
        ServerMessage::Notice {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    fn failure(err: &Error) -> Self {
        let level = if err.is_validation() {
            NoticeLevel::Warning
        } else {
            NoticeLevel::Error
        };
        ServerMessage::Notice {
            level,
            message: err.to_string(),
        }
    }
}

fn init_message(playground: &Playground, capacity: PinCapacity) -> ServerMessage {
    ServerMessage::Init {
        template_id: playground.template_id().to_string(),
        template_name: playground.template_name(),
        instances: playground.instances(),
        catalog: playground
            .catalog()
            .into_iter()
            .map(|d| CatalogEntry {
                id: d.id,
                name: d.name,
                kind: d.kind,
                pin_required: d.pin_required,
            })
            .collect(),
        capacity,
    }
}

/// Render message for a scene change
fn translate(playground: &Playground, update: SceneUpdate, capacity: PinCapacity) -> Option<ServerMessage> {
    match update {
        SceneUpdate::Placed { instance } | SceneUpdate::Configured { instance } => {
            Some(ServerMessage::Update { instance })
        }
        SceneUpdate::Moved { instance_id, .. } | SceneUpdate::ValueChanged { instance_id, .. } => playground
            .instance(&instance_id)
            .map(|instance| ServerMessage::Update { instance }),
        SceneUpdate::Removed { instance_id } => Some(ServerMessage::Removed { instance_id }),
        SceneUpdate::Reloaded => Some(init_message(playground, capacity)),
    }
}

/// Applies one client message; returns the reply meant for that client only
async fn handle_message(playground: &Playground, msg: ClientMessage) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Add { widget_id, position } => {
            playground.add_widget(&widget_id, position).err().map(|err| ServerMessage::failure(&err))
        }
        ClientMessage::DragStart { instance_id } => {
            playground.drag_start(&instance_id);
            None
        }
        ClientMessage::DragMove { instance_id, dx, dy } => {
            playground.drag_move(&instance_id, dx, dy);
            None
        }
        ClientMessage::DragEnd { instance_id, dx, dy } => {
            playground.drag_end(&instance_id, dx, dy);
            None
        }
        ClientMessage::Click { instance_id } => match playground.click(&instance_id).await {
            Ok(dialog) => dialog.map(|dialog| ServerMessage::Dialog { dialog }),
            Err(err) => Some(ServerMessage::failure(&err)),
        },
        ClientMessage::SetValue { instance_id, value } => {
            playground.set_value(&instance_id, value);
            None
        }
        ClientMessage::Delete { instance_id } => match playground.delete(&instance_id).await {
            Ok(_) => None,
            Err(err) => Some(ServerMessage::failure(&err)),
        },
        ClientMessage::SaveConfig { dialog } => match playground.save_config(&dialog).await {
            Ok(_) => Some(ServerMessage::info("Configuration saved")),
            Err(err) => Some(ServerMessage::failure(&err)),
        },
        ClientMessage::ResetConfig { mut dialog } => match playground.reset_config(&mut dialog).await {
            Ok(()) => Some(ServerMessage::Dialog { dialog }),
            Err(err) => Some(ServerMessage::failure(&err)),
        },
        ClientMessage::Save => match playground.save().await {
            Ok(report) => Some(match report.warning() {
                Some(warning) => ServerMessage::Notice {
                    level: NoticeLevel::Warning,
                    message: warning,
                },
                None => ServerMessage::info(format!("Saved {} widget(s)", report.saved)),
            }),
            Err(err) => Some(ServerMessage::failure(&err)),
        },
    }
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "failed to encode server message");
            true
        }
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(playground): State<Playground>) -> impl IntoResponse {
    ws.on_upgrade(|socket| websocket(socket, playground))
}

async fn websocket(stream: WebSocket, playground: Playground) {
    let (mut sender, mut receiver) = stream.split();

    let mut updates = playground.subscribe();
    let mut capacity = playground.capacity();
    let current = *capacity.borrow_and_update();
    if !send_json(&mut sender, &init_message(&playground, current)).await {
        return;
    }
    debug!(template_id = %playground.template_id(), "editor client connected");

    let (reply_tx, mut replies) = mpsc::unbounded_channel::<ServerMessage>();

    let sender_playground = playground.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                update = updates.recv() => match update {
                    Ok(update) => translate(&sender_playground, update, *capacity.borrow()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "editor client fell behind, resending scene");
                        Some(init_message(&sender_playground, *capacity.borrow()))
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = capacity.changed() => match changed {
                    Ok(()) => {
                        let PinCapacity { free, total } = *capacity.borrow_and_update();
                        Some(ServerMessage::Capacity { free, total })
                    }
                    Err(_) => break,
                },
                reply = replies.recv() => match reply {
                    Some(reply) => Some(reply),
                    None => break,
                },
            };
            if let Some(msg) = msg
                && !send_json(&mut sender, &msg).await
            {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        if let Some(reply) = handle_message(&playground, client_msg).await
                            && reply_tx.send(reply).is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "ignoring malformed client message"),
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
    debug!("editor client disconnected");
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn generate_html(title: &str, body_content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <link rel="stylesheet" href="/static/playground.css">
</head>
<body>
{body_content}
    <script type="module" src="/static/playground.js"></script>
</body>
</html>"#,
        title = escape_html(title),
        body_content = body_content
    )
}

/// Router settings for the canvas host
pub struct HostConfig {
    pub playground: Playground,
    /// Directory served under `/static`
    pub static_dir: String,
    pub title: String,
    /// Body markup of the editor page
    pub body_html: String,
}

impl HostConfig {
    pub fn new(playground: Playground, body_html: impl Into<String>) -> Self {
        Self {
            playground,
            static_dir: "static".to_string(),
            title: "Playground".to_string(),
            body_html: body_html.into(),
        }
    }

    /// Default editor shell with title and static dir taken from `config`
    pub fn from_config(config: &PlaygroundConfig, playground: Playground) -> Self {
        Self::new(playground, DEFAULT_BODY)
            .title(config.title.clone())
            .static_dir(config.static_dir.clone())
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn static_dir(mut self, dir: impl Into<String>) -> Self {
        self.static_dir = dir.into();
        self
    }
}

/// Builds the host router: `/` (editor page), `/ws` (editor socket) and
/// `/static` (assets).
pub fn create_router(config: HostConfig) -> Router {
    let html_content = generate_html(&config.title, &config.body_html);

    Router::new()
        .route("/", get(move || async move { Html(html_content) }))
        .route("/ws", get(websocket_handler))
        .nest_service("/static", ServeDir::new(config.static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(config.playground)
}

/// Binds `addr` and serves the canvas host until the process exits
pub async fn start_server(config: HostConfig, addr: impl AsRef<str>) -> std::io::Result<()> {
    let app = create_router(config);
    let listener = tokio::net::TcpListener::bind(addr.as_ref()).await?;
    info!(addr = %listener.local_addr()?, "canvas host listening");
    axum::serve(listener, app).await
}
