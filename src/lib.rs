//! Discord bot that relays messages to a chat-completion backend, keeping a
//! short per-user conversation and feeding recent channel messages in as
//! context.

pub mod commands;
pub mod config;
pub mod conversation_manager;
pub mod discord_manager;
pub mod ledger;
pub mod llm;
pub mod session_store;

#[cfg(test)]
mod tests;
