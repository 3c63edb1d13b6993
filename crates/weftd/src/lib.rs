//! weftd - weft overlay network node daemon
//!
//! Binds one UDP endpoint, joins the configured super peers, and serves
//! virtual channels to every peer it talks to.

pub mod config;
pub mod node;
