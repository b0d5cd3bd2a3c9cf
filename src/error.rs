use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("no space: {0}")]
    NoSpace(&'static str),

    #[error("too many links")]
    TooManyLinks,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("filesystem is read-only")]
    ReadOnly,

    #[error("IO error: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("recovery required for {0}")]
    RecoveryRequired(PathBuf),

    #[error("NUMA unavailable: {0}")]
    NumaUnavailable(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Maps the error to a POSIX errno for the bridge boundary.
    #[cfg(unix)]
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NoSpace(_) => libc::ENOSPC,
            FsError::TooManyLinks => libc::EMLINK,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::ReadOnly => libc::EROFS,
            FsError::IoFailed(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Corrupted(_) => libc::EIO,
            FsError::RecoveryRequired(_) => libc::EIO,
            FsError::NumaUnavailable(_) => libc::ENOSYS,
            FsError::Unsupported(_) => libc::ENOSYS,
        }
    }

    /// True for errors that must flip the filesystem into read-only mode.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FsError::Corrupted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NoSpace("arena").errno(), libc::ENOSPC);
        assert_eq!(FsError::Unsupported("symlink").errno(), libc::ENOSYS);
    }

    #[test]
    fn fatal_classification() {
        assert!(FsError::Corrupted("bad header".into()).is_fatal());
        assert!(!FsError::NotFound.is_fatal());
        assert!(!FsError::ReadOnly.is_fatal());
    }
}
