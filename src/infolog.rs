//! The info logger writes human-readable progress lines to the LOG file inside a database
//! directory. It is not the write-ahead log.

use std::io::Write;

pub struct Logger(pub Box<dyn Write>);

impl Logger {
    pub fn new(w: Box<dyn Write>) -> Logger {
        Logger(w)
    }

    pub fn log(&mut self, message: &str) {
        let _ = self.0.write(message.as_bytes());
        let _ = self.0.write(b"\n");
    }
}

#[macro_export]
macro_rules! log {
    ($l:expr) => {
        if let Some(l) = $l.as_ref() {
            l.borrow_mut().log("")
        }
    };
    ($l:expr, $fmt:expr) => {
        if let Some(l) = $l.as_ref() {
            l.borrow_mut().log($fmt)
        }
    };
    ($l:expr, $fmt:expr, $($v:expr),*) => {
        if let Some(l) = $l.as_ref() {
            l.borrow_mut().log(format!($fmt, $($v),*).as_str())
        }
    };
}
