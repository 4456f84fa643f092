//! Azure OpenAI provider

pub mod client;
pub mod config;

pub use client::AzureOpenAIAdapter;
pub use config::AzureConfig;
