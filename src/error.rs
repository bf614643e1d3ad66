//! Central error handling for the wavefront integrator
//!
//! Provides a unified RenderError enum with consistent categorization.
//! Device errors are fatal for the current render pass and are never retried.

/// Centralized error type for all scheduler and device operations
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Readback error: {0}")]
    Readback(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Short category tag used when reporting errors to the driver
    pub fn category(&self) -> &'static str {
        match self {
            RenderError::Device(_) => "Device",
            RenderError::Upload(_) => "Upload",
            RenderError::Render(_) => "Render",
            RenderError::Readback(_) => "Readback",
            RenderError::Config(_) => "Config",
            RenderError::Io(_) => "IO",
        }
    }

    /// True for failures that must abort the current render pass
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Device(_) | RenderError::Render(_))
    }

    /// Convenience constructors for common error types
    pub fn device<T: ToString>(msg: T) -> Self {
        RenderError::Device(msg.to_string())
    }

    pub fn upload<T: ToString>(msg: T) -> Self {
        RenderError::Upload(msg.to_string())
    }

    pub fn render<T: ToString>(msg: T) -> Self {
        RenderError::Render(msg.to_string())
    }

    pub fn readback<T: ToString>(msg: T) -> Self {
        RenderError::Readback(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        RenderError::Config(msg.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Config(err.to_string())
    }
}

/// Result type alias for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_prefix_messages() {
        let err = RenderError::device("synchronize failed");
        assert_eq!(err.category(), "Device");
        assert_eq!(err.to_string(), "Device error: synchronize failed");
        assert!(err.is_fatal());
        assert!(!RenderError::config("bad divisor").is_fatal());
    }
}
