//! HTTP API layer for the ShopChat support service

pub(crate) mod chat;
pub mod client;

pub use chat::HttpTransport;
pub use client::ApiClient;
