pub mod config;
pub mod error;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::ClipperError;
pub use types::*;
pub use util::content_hash;
