pub mod client;
pub mod config;

pub use client::{ProviderError, SearchQuery, TrackingClient, TrackingProvider};
