use std::fmt;

/// Failure taxonomy of the bridge engine. Every variant is recovered at the
/// component boundary that produced it; none of them crashes the process.
#[derive(Debug)]
pub enum BridgeError {
    /// Network/auth/vendor-side failure while talking to an AI backend.
    Backend {
        backend: &'static str,
        message: String,
    },
    /// The messaging gateway rejected or failed a call.
    Gateway { message: String },
    /// The audio pipeline (download, ffmpeg, silk encode) failed.
    Transcode { message: String },
    /// One or more reply segments failed to send; the rest were delivered.
    DispatchPartial { failed: usize, total: usize },
}

impl BridgeError {
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway {
            message: message.into(),
        }
    }

    pub fn transcode(message: impl Into<String>) -> Self {
        Self::Transcode {
            message: message.into(),
        }
    }

    pub fn dispatch_partial(failed: usize, total: usize) -> Self {
        Self::DispatchPartial { failed, total }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::Gateway { .. } => "GATEWAY_ERROR",
            Self::Transcode { .. } => "TRANSCODE_ERROR",
            Self::DispatchPartial { .. } => "DISPATCH_PARTIAL_FAILURE",
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { backend, message } => {
                write!(f, "backend {backend} failed: {message}")
            }
            Self::Gateway { message } => write!(f, "gateway call failed: {message}"),
            Self::Transcode { message } => write!(f, "audio transcode failed: {message}"),
            Self::DispatchPartial { failed, total } => {
                write!(f, "dispatch delivered {}/{total} segments", total - failed)
            }
        }
    }
}

impl std::error::Error for BridgeError {}
