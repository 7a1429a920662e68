//! Kernel error codes.
//!
//! Recoverable failures are propagated as [`Errno`] values through
//! `Result`; the syscall boundary converts them to negative integers.
//! Panics are reserved for invariant violations.

use core::fmt;

/// A recoverable kernel error, mirroring the classic errno set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No such file or directory.
    NoEnt = 2,
    /// I/O error.
    Io = 5,
    /// No such device or address.
    Nxio = 6,
    /// Bad file descriptor.
    BadF = 9,
    /// No child processes.
    Child = 10,
    /// Try again.
    Again = 11,
    /// Out of memory.
    NoMem = 12,
    /// Device or resource busy.
    Busy = 16,
    /// File exists.
    Exist = 17,
    /// Cross-device link.
    Xdev = 18,
    /// Not a directory.
    NotDir = 20,
    /// Is a directory.
    IsDir = 21,
    /// Invalid argument.
    Inval = 22,
    /// Too many open files.
    MFile = 24,
    /// No space left on device.
    NoSpc = 28,
    /// Illegal seek.
    SPipe = 29,
    /// Read-only filesystem.
    RoFs = 30,
    /// Out of range.
    Range = 34,
    /// Filename too long.
    NameTooLong = 36,
    /// Too many levels of symbolic links.
    Loop = 40,
    /// Operation not supported.
    NotSup = 95,
    /// Operation timed out.
    TimedOut = 110,
}

impl Errno {
    /// Returns the negative integer form used at the syscall boundary.
    #[inline]
    pub const fn as_neg(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Returns the short symbolic name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoEnt => "ENOENT",
            Self::Io => "EIO",
            Self::Nxio => "ENXIO",
            Self::BadF => "EBADF",
            Self::Child => "ECHILD",
            Self::Again => "EAGAIN",
            Self::NoMem => "ENOMEM",
            Self::Busy => "EBUSY",
            Self::Exist => "EEXIST",
            Self::Xdev => "EXDEV",
            Self::NotDir => "ENOTDIR",
            Self::IsDir => "EISDIR",
            Self::Inval => "EINVAL",
            Self::MFile => "EMFILE",
            Self::NoSpc => "ENOSPC",
            Self::SPipe => "ESPIPE",
            Self::RoFs => "EROFS",
            Self::Range => "ERANGE",
            Self::NameTooLong => "ENAMETOOLONG",
            Self::Loop => "ELOOP",
            Self::NotSup => "ENOTSUP",
            Self::TimedOut => "ETIMEDOUT",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result type used throughout the kernel.
pub type KResult<T> = Result<T, Errno>;

/// Converts a `KResult<usize>` into the signed syscall return convention:
/// the value on success, `-errno` on failure.
#[inline]
pub fn syscall_ret(res: KResult<usize>) -> i64 {
    match res {
        Ok(v) => v as i64,
        Err(e) => e.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_form() {
        assert_eq!(Errno::NoEnt.as_neg(), -2);
        assert_eq!(Errno::Inval.as_neg(), -22);
        assert_eq!(Errno::NotSup.as_neg(), -95);
    }

    #[test]
    fn syscall_convention() {
        assert_eq!(syscall_ret(Ok(7)), 7);
        assert_eq!(syscall_ret(Err(Errno::BadF)), -9);
    }

    #[test]
    fn names() {
        assert_eq!(Errno::Range.name(), "ERANGE");
        assert_eq!(format!("{}", Errno::NotDir), "ENOTDIR");
    }
}
