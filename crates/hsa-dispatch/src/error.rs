use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Feature gaps that are rejected instead of silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnimplementedFeature {
    ImageArgument,
    SamplerArgument,
    AutomaticLocalBuffer,
}

impl UnimplementedFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnimplementedFeature::ImageArgument => "image kernel arguments",
            UnimplementedFeature::SamplerArgument => "sampler kernel arguments",
            UnimplementedFeature::AutomaticLocalBuffer => "automatic local buffers",
        }
    }
}

/// Error surfaced by the compile/cache/dispatch pipeline.
///
/// Only [`DispatchError::Toolchain`] and [`DispatchError::Io`] describe conditions a caller
/// can retry around; every other variant reports a toolchain, hardware or marshalling
/// contract violation and is classified as fatal by [`DispatchError::is_fatal`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{tool} failed (status={status:?}): {stderr}")]
    Toolchain {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("HSA call {step} failed with status {status:#x}: {message}")]
    Runtime {
        step: &'static str,
        status: u32,
        message: String,
    },
    #[error("kernel symbol {symbol} resolves to a {kind} symbol, not a kernel")]
    SymbolKind { symbol: String, kind: &'static str },
    #[error(
        "kernel argument {index} needs {required} bytes at offset {offset}, \
         but the kernarg segment holds {capacity} bytes"
    )]
    KernargOverflow {
        index: usize,
        offset: usize,
        required: usize,
        capacity: usize,
    },
    #[error("required group memory {required} exceeds device local memory {available}")]
    LocalMemoryExceeded { required: u64, available: u64 },
    #[error("{} are not implemented", feature.as_str())]
    Unimplemented { feature: UnimplementedFeature },
    #[error("invalid kernel argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },
    #[error("invalid launch: {0}")]
    InvalidLaunch(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("HSA runtime unavailable: {0}")]
    LibraryUnavailable(String),
}

impl DispatchError {
    pub fn toolchain(tool: impl Into<String>, status: Option<i32>, stderr: impl Into<String>) -> Self {
        DispatchError::Toolchain {
            tool: tool.into(),
            status,
            stderr: stderr.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DispatchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn runtime(step: &'static str, status: u32, message: impl Into<String>) -> Self {
        DispatchError::Runtime {
            step,
            status,
            message: message.into(),
        }
    }

    pub fn unimplemented(feature: UnimplementedFeature) -> Self {
        DispatchError::Unimplemented { feature }
    }

    pub fn invalid_argument(index: usize, reason: impl Into<String>) -> Self {
        DispatchError::InvalidArgument {
            index,
            reason: reason.into(),
        }
    }

    pub fn invalid_launch(message: impl Into<String>) -> Self {
        DispatchError::InvalidLaunch(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        DispatchError::InvalidConfig(message.into())
    }

    /// Whether the error leaves the device in a state the caller cannot recover from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DispatchError::Toolchain { .. }
                | DispatchError::Io { .. }
                | DispatchError::InvalidConfig(_)
                | DispatchError::LibraryUnavailable(_)
        )
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, DispatchError::Unimplemented { .. })
    }
}

/// Convenience alias for results returned by the dispatch pipeline.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toolchain_failures_are_retryable() {
        let err = DispatchError::toolchain("llc", Some(1), "bad input");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "llc failed (status=Some(1)): bad input");
    }

    #[test]
    fn unimplemented_is_distinct_and_fatal() {
        let err = DispatchError::unimplemented(UnimplementedFeature::SamplerArgument);
        assert!(err.is_unimplemented());
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "sampler kernel arguments are not implemented");
    }

    #[test]
    fn runtime_errors_name_the_failing_step() {
        let err = DispatchError::runtime("hsa_executable_freeze", 0x1001, "invalid argument");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("hsa_executable_freeze"));
    }
}
