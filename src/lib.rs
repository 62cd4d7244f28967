//! The kvmd daemon: component wiring, HTTP/WS API surface and the
//! orchestrating server loop. All reusable machinery lives in the
//! workspace crates; this crate owns policy and glue.

pub mod api;
pub mod config;
pub mod logring;
pub mod printer;
pub mod pststore;
pub mod server;
pub mod streamer;
