//! Core library for an ACME (RFC 8555) client: directory discovery, account
//! creation, order placement, challenge fulfillment and certificate
//! retrieval, driven over a hand-rolled JOSE signing layer. The CLI
//! (`src/bin.rs`) is a thin wrapper around [`client::AcmeClient`].

pub mod challenge;
pub mod client;
pub mod dns;
pub mod error;
pub mod http_responder;
pub mod jose;
pub mod store;
pub mod transport;
pub mod util;
