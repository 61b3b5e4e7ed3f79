use std::fmt;

/// Error type used throughout the workspace.
#[derive(Debug)]
pub struct SableError {
    /// Message for the error.
    msg: String,

    /// Optional error that triggered this one.
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SableError {
    pub fn new(msg: impl Into<String>) -> Self {
        SableError {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn with_source(
        msg: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        SableError {
            msg: msg.into(),
            source: Some(source),
        }
    }
}

impl fmt::Display for SableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for SableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as _)
    }
}

pub type Result<T, E = SableError> = std::result::Result<T, E>;

/// An extension trait for adding context to the error variant of a result.
pub trait ResultExt<T, E> {
    /// Wrap an error with a static context string.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with a context string generated from a function.
    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T, E> for Result<T, E> {
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(SableError::with_source(msg, Box::new(err))),
        }
    }

    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(SableError::with_source(f(), Box::new(err))),
        }
    }
}

/// An extension trait for converting `None` into a descriptive error.
pub trait OptionExt<T> {
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(SableError::new(format!("Missing required value: {msg}"))),
        }
    }
}

/// Return a "not yet implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        return Err($crate::SableError::new(format!("Not yet implemented: {msg}")));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_source() {
        let res: Result<(), _> = "nope".parse::<i64>().map(|_| ());
        let err = res.context("parse failed").unwrap_err();
        assert_eq!("parse failed", err.to_string());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn required_on_none() {
        let opt: Option<usize> = None;
        let err = opt.required("thing").unwrap_err();
        assert!(err.to_string().contains("thing"));
    }
}
