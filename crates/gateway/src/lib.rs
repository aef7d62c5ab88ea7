//! HTTP surface of courier.
//!
//! - `POST <webhook_path>`: push-mode intake, `200` once queued, `503` under
//!   backpressure
//! - `GET /health`: aggregate health, transport mode and queue depth
//! - `GET /status`: full transport, health, queue and error-history snapshot
//!
//! Also ships the [`Dispatch`](courier_ingest::Dispatch) implementations the
//! binary can wire in.

pub mod dispatch;
pub mod server;

pub use {
    dispatch::{HttpForwarder, LogDispatcher, dispatcher_from_config},
    server::{AppState, ListenerProbe, bind, build_app, serve},
};
