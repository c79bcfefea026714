//! IoT Playground - widget placement and configuration core
//!
//! The playground edits a *template*: a canvas of widgets (switches, sliders,
//! gauges, ...) that are bound to virtual pins of a remote device. The data
//! layer lives here in Rust; presentation is left to whatever front-end
//! connects to the canvas host.
//!
//! # Architecture
//!
//! - **Codec** ([`codec`]): lenient decoding of the semi-structured widget
//!   configuration documents stored by the catalog service.
//! - **Scene** ([`scene`]): ordered, in-memory set of placed widget instances.
//! - **Pins** ([`pins`]): client for the template's virtual pin pool. The
//!   service is authoritative; a pin is bound to at most one widget.
//! - **Controller** ([`controller`]): the [`Playground`], which turns editor
//!   interactions (drag, click, configure, save) into scene mutations and
//!   pin calls and publishes every change as a [`SceneUpdate`].
//! - **Gateway** ([`gateway`]): [`TemplateGateway`] contract plus the
//!   `reqwest` implementation [`HttpGateway`].
//! - **Live channel** ([`live`]): WebSocket side channel that forwards local
//!   value changes to the device and applies remote ones.
//! - **Host** ([`host`]): `axum` router serving the editor page and a JSON
//!   WebSocket protocol over the playground.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use iot_playground::{HostConfig, HttpGateway, LiveChannel, Playground, PlaygroundConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PlaygroundConfig::from_env()?;
//!     let session = HttpGateway::login(&config, "provider-token").await?;
//!     let gateway = Arc::new(HttpGateway::new(&config, session.clone())?);
//!
//!     let playground = Playground::open(&config, gateway, "template-id").await?;
//!     let live = LiveChannel::spawn(&config, session, playground.clone());
//!
//!     let host = HostConfig::from_config(&config, playground);
//!     iot_playground::start_server(host, "127.0.0.1:3000").await?;
//!     live.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod controller;
pub mod drag;
pub mod error;
pub mod gateway;
pub mod host;
pub mod live;
pub mod model;
pub mod pins;
pub mod scene;
pub mod session;

#[cfg(test)]
mod testing;

pub use codec::{ConfigDocument, PinBinding, WidgetType, WidgetValue};
pub use config::PlaygroundConfig;
pub use controller::{ConfigDialog, Playground, SaveReport, SceneUpdate, ValueOrigin};
pub use error::{Error, Result};
pub use gateway::{HttpGateway, TemplateGateway};
pub use host::{HostConfig, create_router, start_server};
pub use live::{ConnectionState, LiveChannel};
pub use model::{Position, VirtualPin, WidgetDefinition};
pub use pins::{PinCapacity, PinClient};
pub use scene::{Scene, WidgetInstance};
pub use session::Session;
