use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// Error kinds surfaced by both engines and the mount layer. The numeric
/// representation is the matching errno value so hosts that speak errno can
/// pass these through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum FsError {
    NoEntry = libc::ENOENT,
    NotDir = libc::ENOTDIR,
    IsDir = libc::EISDIR,
    Exists = libc::EEXIST,
    NotEmpty = libc::ENOTEMPTY,
    NameTooLong = libc::ENAMETOOLONG,
    IllegalSeq = libc::EILSEQ,
    TooManyLinks = libc::ELOOP,
    NoSpace = libc::ENOSPC,
    FileTooLarge = libc::EFBIG,
    ReadOnly = libc::EROFS,
    InvalidArg = libc::EINVAL,
    CrossDevice = libc::EXDEV,
    Unsupported = libc::ENOTSUP,
    BadDescriptor = libc::EBADF,
    TooManyFiles = libc::ENFILE,
    NoPermission = libc::EPERM,
    Io = libc::EIO,
    /// Corrupt on-disk metadata (bad rec_len, broken long-name chain, ...).
    Corrupt = libc::EUCLEAN,
    Busy = libc::EBUSY,
    Overflow = libc::EOVERFLOW,
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn errno(self) -> i32 {
        self.into()
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NoEntry => "no such file or directory",
            FsError::NotDir => "not a directory",
            FsError::IsDir => "is a directory",
            FsError::Exists => "file exists",
            FsError::NotEmpty => "directory not empty",
            FsError::NameTooLong => "name too long",
            FsError::IllegalSeq => "illegal byte sequence",
            FsError::TooManyLinks => "too many levels of symbolic links",
            FsError::NoSpace => "no space left on device",
            FsError::FileTooLarge => "file too large",
            FsError::ReadOnly => "read-only filesystem",
            FsError::InvalidArg => "invalid argument",
            FsError::CrossDevice => "cross-device link",
            FsError::Unsupported => "operation not supported",
            FsError::BadDescriptor => "bad file descriptor",
            FsError::TooManyFiles => "too many open files",
            FsError::NoPermission => "operation not permitted",
            FsError::Io => "I/O error",
            FsError::Corrupt => "corrupt filesystem",
            FsError::Busy => "resource busy",
            FsError::Overflow => "value too large",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for FsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        assert_eq!(FsError::NoEntry.errno(), libc::ENOENT);
        assert_eq!(FsError::try_from(libc::EROFS), Ok(FsError::ReadOnly));
        assert_ne!(FsError::Corrupt.errno(), FsError::Io.errno());
    }
}
