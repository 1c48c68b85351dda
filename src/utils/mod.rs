//! Shared helpers: the request gateway, text cleanup and XML reading

pub mod http;
pub mod text;
pub mod xml;
