//! Provider client abstraction: a uniform `ProviderClient` trait, one
//! implementation per provider, and the shared response/continuation
//! types they return.

mod client;
mod types;

pub use client::{
    build_http_client, classify_http_status, classify_transport_error, AnthropicClient,
    GoogleClient, MultiProviderClient, OpenAIClient, ProviderClient,
};
pub use types::{AnthropicTurn, ModelResponse, RawHandle, SolveOpts};
