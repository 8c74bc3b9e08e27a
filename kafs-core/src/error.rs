/*
 * This file is part of KAFS.
 *
 * KAFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * KAFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * KAFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! The error taxonomy shared by every layer of the core, per the design's
//! error handling section. Local functions return `Result<T, Error>`; the
//! POSIX layer is the only place that converts these into errno values.

use std::fmt;
use std::io;

/// A core-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad path, bad flags, forbidden characters, name too long.
    Input,
    /// The target already exists.
    Exists,
    /// The target does not exist.
    NotFound,
    /// The target is not a directory.
    NotADir,
    /// The target is a directory.
    IsADir,
    /// A directory is non-empty where emptiness was required.
    NotEmpty,
    /// The access check failed.
    Permission,
    /// The bitmap, inode table, or HRL entry table is full, or a refcount overflowed.
    NoSpace,
    /// A mapped-memory read/write error, short read/write, or checksum failure.
    Io,
    /// An RPC magic/version/flag mismatch, or a bad message length.
    Protocol,
    /// The operation is not implemented on this branch; the caller should fall back.
    NotImplemented,
    /// A hotplug wait exceeded its configured window.
    Timeout,
}

impl Error {
    /// Returns the POSIX errno this error maps to, for use at the syscall boundary.
    pub fn to_errno(self) -> i32 {
        match self {
            Error::Input => libc::EINVAL,
            Error::Exists => libc::EEXIST,
            Error::NotFound => libc::ENOENT,
            Error::NotADir => libc::ENOTDIR,
            Error::IsADir => libc::EISDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::Permission => libc::EACCES,
            Error::NoSpace => libc::ENOSPC,
            Error::Io => libc::EIO,
            Error::Protocol => libc::EPROTO,
            Error::NotImplemented => libc::ENOSYS,
            Error::Timeout => libc::ETIMEDOUT,
        }
    }

    /// Tells whether this error should trigger a hotplug-proxy fallback to the
    /// local implementation, per the propagation policy.
    pub fn is_fallback_worthy(self) -> bool {
        matches!(self, Error::NotImplemented)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Input => "invalid argument",
            Error::Exists => "already exists",
            Error::NotFound => "not found",
            Error::NotADir => "not a directory",
            Error::IsADir => "is a directory",
            Error::NotEmpty => "directory not empty",
            Error::Permission => "permission denied",
            Error::NoSpace => "no space left",
            Error::Io => "I/O error",
            Error::Protocol => "protocol error",
            Error::NotImplemented => "not implemented",
            Error::Timeout => "operation timed out",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(_: io::Error) -> Self {
        Error::Io
    }
}

/// A `Result` alias for the core's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;
