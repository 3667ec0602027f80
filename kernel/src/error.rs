//! Numeric error codes, in the shape the surfaces of this runtime actually
//! return them (see the error handling design: programmer errors panic,
//! everything else returns one of these).

use std::ffi::CStr;
use std::fmt;

pub mod code {
    //! Named constants. Values are borrowed from `libc`'s errno namespace,
    //! the same way upstream borrows them, even though this core never
    //! makes a real syscall with them.
    use super::Error;

    pub const EOK: Error = Error(0);
    pub const ERROR: Error = Error(-255);
    pub const ETIMEDOUT: Error = Error(-libc::ETIMEDOUT);
    pub const ENOMEM: Error = Error(-libc::ENOMEM);
    pub const EBUSY: Error = Error(-libc::EBUSY);
    pub const ENOENT: Error = Error(-libc::ENOENT);
    pub const EINVAL: Error = Error(-libc::EINVAL);
    pub const EAGAIN: Error = Error(-libc::EAGAIN);
    /// Heap/SRAM consistency-check failure. Not an errno; negative and
    /// distinct from every errno this table otherwise exposes.
    pub const ECORRUPT: Error = Error(-1000);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Error(i32);

impl Error {
    pub fn to_code(self) -> i32 {
        self.0
    }

    pub fn name(&self) -> &'static CStr {
        match *self {
            code::EOK => c"OK",
            code::ERROR => c"ERROR",
            code::ETIMEDOUT => c"Timedout",
            code::ENOMEM => c"Cannot allocate memory",
            code::EBUSY => c"Device or resource busy",
            code::ENOENT => c"No such file or directory",
            code::EINVAL => c"Invalid argument",
            code::EAGAIN => c"Try again",
            code::ECORRUPT => c"Data corrupt",
            _ => c"EUNKNOWN",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::NotFound => code::ENOENT,
            std::io::ErrorKind::WouldBlock => code::EAGAIN,
            _ => code::ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.name().to_str().unwrap_or("unknown error");
        write!(f, "Error({}): {}", self.0, msg)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_known_codes() {
        assert_eq!(code::EOK.name(), c"OK");
        assert_eq!(code::ENOMEM.name(), c"Cannot allocate memory");
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(Error(12345).name(), c"EUNKNOWN");
    }
}
