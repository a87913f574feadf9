/// Result alias that carries the custom [`LofiError`] type.
pub type Result<T> = std::result::Result<T, LofiError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LofiError {
    /// Missing, empty or malformed input handed to a pipeline stage.
    #[error("invalid input to {stage}: {message}")]
    Input {
        stage: &'static str,
        message: String,
    },
    /// Architecture configuration and checkpoint weights disagree.
    #[error("checkpoint does not match architecture ({tensor}): {message}")]
    ConfigMismatch { tensor: String, message: String },
    /// Non-finite values detected in features or model output.
    #[error("non-finite values produced by {stage}: {detail}")]
    NumericInstability { stage: &'static str, detail: String },
    /// The requested compute device cannot be used.
    #[error("resource unavailable: {0}")]
    Resource(String),
    /// Free-form message for failures that do not fit another variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wav: {0}")]
    Wav(#[from] hound::Error),
    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
}

impl LofiError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn input<T: Into<String>>(stage: &'static str, message: T) -> Self {
        Self::Input {
            stage,
            message: message.into(),
        }
    }

    pub fn mismatch<N: Into<String>, T: Into<String>>(tensor: N, message: T) -> Self {
        Self::ConfigMismatch {
            tensor: tensor.into(),
            message: message.into(),
        }
    }

    pub fn unstable<T: Into<String>>(stage: &'static str, detail: T) -> Self {
        Self::NumericInstability {
            stage,
            detail: detail.into(),
        }
    }
}

impl From<&str> for LofiError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LofiError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Fails with [`LofiError::NumericInstability`] when `samples` holds NaN or
/// infinite values.
pub fn ensure_finite(stage: &'static str, samples: &[f32]) -> Result<()> {
    match samples.iter().position(|s| !s.is_finite()) {
        None => Ok(()),
        Some(index) => Err(LofiError::unstable(
            stage,
            format!(
                "sample {index} of {} is {}",
                samples.len(),
                samples[index]
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_check_reports_position() {
        assert!(ensure_finite("test", &[0.0, 1.0]).is_ok());
        let err = ensure_finite("decoder", &[0.0, f32::NAN, 1.0]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("decoder"));
        assert!(text.contains("sample 1 of 3"));
    }
}
