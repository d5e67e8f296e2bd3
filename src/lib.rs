pub mod compression;
pub mod config;
pub mod encoder;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod reaper;
pub mod registry;
pub mod response;
pub mod server;
pub mod token_bucket;

pub use compression::CompressionPool;
pub use config::{Config, EncoderConfig, LimiterConfig};
pub use encoder::{EncodeRequest, EncodedResponse, ResponseEncoder};
pub use error::{ApiError, Error, Result};
pub use reaper::Reaper;
pub use registry::{Admission, ClientRegistry};
pub use server::create_app;
