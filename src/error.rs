use thiserror::Error;

/// Failure reported by the underlying DMA engine driver.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The engine revision does not implement the requested operation.
    #[error("operation not supported by this engine")]
    NotSupported,
    #[error("engine busy")]
    Busy,
    #[error("engine rejected request (errno {0})")]
    Rejected(i32),
}

impl EngineError {
    pub fn errno(&self) -> i32 {
        match self {
            EngineError::NotSupported => libc::ENOSYS,
            EngineError::Busy => libc::EBUSY,
            EngineError::Rejected(e) => *e,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such DMA channel")]
    NoSuchDevice,
    #[error("buffer is not inside a DMA allocation")]
    Fault,
    #[error("DMA engine busy")]
    EngineBusy,
    #[error("DMA transaction timed out")]
    Timeout,
    #[error("DMA transaction did not succeed")]
    EngineFailure,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no DMA channels found")]
    NoChannelsFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("device already open")]
    Busy,
    #[error("inappropriate ioctl for device")]
    NotTty,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Linux errno the driver hands back to userspace for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoSuchDevice | Error::NoChannelsFound => libc::ENODEV,
            Error::Fault => libc::EFAULT,
            Error::EngineBusy | Error::EngineFailure | Error::Busy => libc::EBUSY,
            Error::Timeout => libc::ETIME,
            Error::OutOfMemory => libc::ENOMEM,
            Error::InvalidArgument => libc::EINVAL,
            Error::PermissionDenied => libc::EACCES,
            Error::NotTty => libc::ENOTTY,
            Error::Engine(e) => e.errno(),
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Inverse of [`Error::errno`], used on the client side of the ioctl boundary.
    ///
    /// `EBUSY` is ambiguous on the wire; it maps to [`Error::EngineBusy`].
    pub fn from_errno(errno: i32) -> Error {
        match errno {
            libc::ENODEV => Error::NoSuchDevice,
            libc::EFAULT => Error::Fault,
            libc::EBUSY => Error::EngineBusy,
            libc::ETIME => Error::Timeout,
            libc::ENOMEM => Error::OutOfMemory,
            libc::EINVAL => Error::InvalidArgument,
            libc::EACCES | libc::EPERM => Error::PermissionDenied,
            libc::ENOTTY => Error::NotTty,
            libc::ENOSYS => Error::Engine(EngineError::NotSupported),
            e => Error::Io(std::io::Error::from_raw_os_error(e)),
        }
    }
}
