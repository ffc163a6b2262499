//! Data models for support-chat entities

mod message;

pub use message::*;
