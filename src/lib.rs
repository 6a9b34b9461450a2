//! Backend for an AI page builder: turns streamed model tool calls into
//! validated, deduplicated build operations for a Puck editor.

pub mod catalog;
pub mod chat;
pub mod config;
pub mod function;
pub mod http_client;
pub mod llm_client;
pub mod ops;
pub mod partial_json;
pub mod server;
pub mod stream;
pub mod tools;
