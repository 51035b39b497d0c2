use cudarc::driver::sys::CUresult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{context}: {status:?}")]
    Driver { status: CUresult, context: String },

    #[error("IPC memory handle yielded a null pointer")]
    NullPointer,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid IPC handle: {0}")]
    InvalidHandle(String),

    #[error("Failed loading the CUDA driver library from {path}: {source}")]
    LibraryLoad {
        path: String,
        #[source]
        source: libloading::Error,
    },
}

impl Error {
    pub(crate) fn driver(status: CUresult, context: impl Into<String>) -> Self {
        Error::Driver {
            status,
            context: context.into(),
        }
    }

    /// The runtime status code behind this error, if it came from a driver call.
    pub fn status(&self) -> Option<CUresult> {
        match self {
            Error::Driver { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches a message to a raw driver status, turning it into an [`Error`].
pub(crate) trait StatusExt<T> {
    fn with_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> StatusExt<T> for std::result::Result<T, CUresult> {
    fn with_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|status| Error::driver(status, context()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn driver_error_message_carries_context_and_status() {
        let failed: std::result::Result<(), CUresult> =
            Err(CUresult::CUDA_ERROR_INVALID_VALUE);
        let err = failed
            .with_context(|| "Failed doing the thing".to_string())
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed doing the thing: CUDA_ERROR_INVALID_VALUE"
        );
        assert_eq!(err.status(), Some(CUresult::CUDA_ERROR_INVALID_VALUE));
    }

    #[test]
    fn success_passes_value_through() {
        let ok: std::result::Result<u64, CUresult> = Ok(0xdead_beef);
        let value = ok.with_context(|| unreachable!()).unwrap();
        assert_eq!(value, 0xdead_beef);
    }

    #[test]
    fn non_driver_errors_have_no_status() {
        assert!(Error::NullPointer.status().is_none());
        assert_eq!(
            Error::NullPointer.to_string(),
            "IPC memory handle yielded a null pointer"
        );
    }
}
