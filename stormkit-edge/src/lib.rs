//! Stormkit hosting edge.
//!
//! Terminates TLS with on-demand certificate issuance, resolves every
//! incoming request to a tenant deployment, serves static and dynamic
//! assets and enforces per-request policy: redirects, the auth wall,
//! image optimization and analytics capture.

pub mod admin;
pub mod analytics;
pub mod authwall;
pub mod bots;
pub mod certs;
pub mod hosts;
pub mod html;
pub mod imageopt;
pub mod invoker;
pub mod pipeline;
pub mod redirects;
pub mod server;
