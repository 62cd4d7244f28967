//! Persistent-state storage: a read-mostly partition remounted RW only
//! while client sessions hold it. Ships both the server (the `kvmd-pst`
//! binary) and the in-daemon client.

mod client;
pub mod server;

pub use client::{PstClient, PstClientConfig, PstError, PstWriteSession};
pub use server::{PstServer, PstServerConfig};
