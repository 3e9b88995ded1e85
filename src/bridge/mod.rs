//! WebSocket Bridge
//!
//! One bridge per logical channel (`html`, `data`, ...) relays bus traffic to
//! browser connections and client frames back onto the bus.
//!
//! ## Architecture
//!
//! - **Bridge**: owns the hub, subscribes to `ws.<channel>.broadcast` and
//!   `ws.<channel>.direct`, serves `/ws/<channel>`
//! - **Hub**: single event loop holding every connection record
//! - **Connection**: one reader and one writer per socket
//! - **Codec**: the channel's inbound envelope and outbound framing
//!
//! ## Example
//!
//! ```javascript
//! // Browser, html channel
//! const ws = new WebSocket('ws://localhost:8080/ws/html');
//! ws.onmessage = (event) => document.body.insertAdjacentHTML('beforeend', event.data);
//! ws.send(JSON.stringify({action: 'chat.messages', body: 'hello'}));
//! ```

mod codec;
mod config;
mod connection;
mod error;
mod handler;
mod hub;
mod runtime;

pub use codec::{Codec, DecodeError, Inbound};
pub use config::BridgeConfig;
pub use connection::ClientEvent;
pub use error::{BridgeError, BridgeResult};
pub use handler::upgrade;
pub use hub::{ClientHandle, ConnectionId, Hub, HubLoop, HubStats};
pub use runtime::Bridge;
