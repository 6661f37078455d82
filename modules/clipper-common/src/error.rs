use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClipperError {
    /// Invalid configuration — missing env vars, malformed knob values.
    /// The one category that propagates as a hard error, because retrying
    /// cannot fix it.
    #[error("Configuration error: {0}")]
    Config(String),
}
