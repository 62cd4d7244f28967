//! HTTP/WS server framework shared by the main daemon and the
//! persistent-state server: unix-socket serving, the auth pipeline,
//! response envelopes and the WS session registry.

pub mod auth;
pub mod response;
pub mod server;
pub mod ws;

pub use auth::{auth_middleware, ApiMeta, AuthGate, AuthInfo, EndpointMeta, PeerCreds};
pub use response::{json_error, json_response, ndjson_error_line, ndjson_line, ApiResult, HttpError};
pub use server::{serve, ServerConfig};
pub use ws::{parse_ws_event, WsDispatcher, WsRegistry, WsSession};
