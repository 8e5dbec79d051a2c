//! Proxy listeners and the interception pipeline
//!
//! `server` owns the accept loop and cleartext path, `connect` dispatches
//! CONNECTs between the blind tunnel and the MITM interceptor, `intercept`
//! terminates TLS with minted certificates, `http1` parses and serializes
//! HTTP/1.1 over raw streams, and `handler` drives the interceptor chain,
//! session fabric, and mode service for each parsed request.

pub mod connect;
pub mod handler;
pub mod http1;
pub mod intercept;
pub mod server;

pub use server::{run_proxy, ProxyServices};
