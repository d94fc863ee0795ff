use std::{fmt, io};

// Numbers show up in Debug output, keep them stable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Internal = 3,
    Usage = 4, // bad settings or arguments
    Format = 6, // unparsable input, e.g. a maps line
    Sanity = 16,
    Environment = 26,
    OutOfMemory = 29, // couldn't reserve address space for a store
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error { Error {error: ErrorEnum::Code(code), message} }
    pub fn from_io_error(e: io::Error, message: String) -> Error { Error {error: ErrorEnum::IO(e), message} }

    pub fn code(&self) -> Option<ErrorCode> {
        if let ErrorEnum::Code(c) = self.error { Some(c) } else { None }
    }
    pub fn is_usage(&self) -> bool { self.code() == Some(ErrorCode::Usage) }
    pub fn is_out_of_memory(&self) -> bool { self.code() == Some(ErrorCode::OutOfMemory) }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Error::from_io_error(e, String::new()) }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self { Error::new(ErrorCode::Format, e.to_string()) }
}

impl From<std::env::VarError> for Error {
    fn from(e: std::env::VarError) -> Self { Error::new(ErrorCode::Environment, e.to_string()) }
}

// Debug includes the code, Display is what the user sees.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            ErrorEnum::Code(code) => write!(f, "{}: {}", *code as i64, self.message),
            ErrorEnum::IO(e) => write!(f, "{}: {:?}", self.message, e.kind()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            ErrorEnum::Code(_) => f.write_str(&self.message),
            ErrorEnum::IO(e) if self.message.is_empty() => write!(f, "{}", e),
            ErrorEnum::IO(e) => write!(f, "{}: {}", self.message, e),
        }
    }
}

impl std::error::Error for Error {}

// io::Error isn't Clone; keep the errno or at least the kind.
impl Clone for Error {
    fn clone(&self) -> Self {
        let error = match &self.error {
            ErrorEnum::Code(c) => ErrorEnum::Code(*c),
            ErrorEnum::IO(e) => ErrorEnum::IO(e.raw_os_error().map_or_else(|| io::Error::from(e.kind()), io::Error::from_raw_os_error)),
        };
        Error {error, message: self.message.clone()}
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}

#[cfg(test)]
mod tests {
    use crate::{*, error::*};

    fn parse_bits(s: &str) -> Result<u32> {
        let v: u32 = s.parse()?;
        if v > 40 {
            return err!(Usage, "too many bits: {}", v);
        }
        Ok(v)
    }

    #[test]
    fn codes_and_messages() {
        assert_eq!(parse_bits("12").unwrap(), 12);
        let e = parse_bits("41").unwrap_err();
        assert!(e.is_usage());
        assert_eq!(format!("{}", e), "too many bits: 41");
        assert_eq!(format!("{:?}", e), "4: too many bits: 41");
        let e = parse_bits("x").unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::Format));
        let e = Error::from_io_error(std::io::Error::from_raw_os_error(libc::ENOMEM), "mmap failed".to_string());
        assert!(e.code().is_none());
        assert!(format!("{}", e.clone()).starts_with("mmap failed: "));
    }
}
