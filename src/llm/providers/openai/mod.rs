//! OpenAI provider

pub mod client;
pub mod config;
pub mod types;

pub use client::OpenAIAdapter;
pub use config::OpenAIConfig;
