//! The Status type used throughout the crate. A Status describes both the kind of a failure and
//! a human-readable message.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::result;

/// StatusCode describes various failure modes of database operations.
#[derive(Clone, Debug, PartialEq)]
#[allow(dead_code)]
pub enum StatusCode {
    OK,

    /// The requested key has no visible value.
    NotFound,
    /// A read was attempted on a batch constructed without an index.
    NotIndexed,
    /// A batch's count overflowed or its wire format is malformed.
    InvalidBatch,
    /// Checksum mismatch, truncated varint, unknown kind, bad magic or version.
    Corruption,
    /// The memtable cannot fit an entry; internal only, triggers rotation.
    ArenaFull,

    NotSupported,
    InvalidArgument,
    InvalidData,
    PermissionDenied,
    AlreadyExists,
    LockError,
    IOError,
    Unknown,
    Errno(errno::Errno),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub err: String,
}

impl Default for Status {
    fn default() -> Status {
        Status {
            code: StatusCode::OK,
            err: String::new(),
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter) -> result::Result<(), fmt::Error> {
        fmt.write_str(&self.err)
    }
}

impl Error for Status {}

impl Status {
    pub fn new(code: StatusCode, msg: &str) -> Status {
        let err = if msg.is_empty() {
            format!("{:?}", code)
        } else {
            format!("{:?}: {}", code, msg)
        };
        Status { code, err }
    }

    pub fn annotate<S: AsRef<str>>(self, msg: S) -> Status {
        Status {
            code: self.code,
            err: format!("{}: {}", msg.as_ref(), self.err),
        }
    }
}

/// Results throughout the crate are based on the Status type.
pub type Result<T> = result::Result<T, Status>;

/// err returns a new Status wrapped in a Result.
pub fn err<T>(code: StatusCode, msg: &str) -> Result<T> {
    Err(Status::new(code, msg))
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Status {
        let c = match e.kind() {
            io::ErrorKind::NotFound => StatusCode::NotFound,
            io::ErrorKind::InvalidData => StatusCode::Corruption,
            io::ErrorKind::InvalidInput => StatusCode::InvalidArgument,
            io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            _ => StatusCode::IOError,
        };

        Status::new(c, &e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let s = Status::new(StatusCode::NotFound, "mykey");
        assert_eq!(s.code, StatusCode::NotFound);
        assert!(s.err.contains("mykey"));

        let r: Result<()> = err(StatusCode::InvalidBatch, "count overflow");
        assert_eq!(r.err().unwrap().code, StatusCode::InvalidBatch);
    }

    #[test]
    fn test_status_annotate() {
        let s = Status::new(StatusCode::Corruption, "bad block").annotate("table 000005");
        assert!(s.err.starts_with("table 000005"));
        assert_eq!(s.code, StatusCode::Corruption);
    }
}
