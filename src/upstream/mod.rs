pub mod client;
pub mod stream;
pub mod types;

pub use client::{UpstreamClient, UpstreamError};
pub use stream::EventStream;
