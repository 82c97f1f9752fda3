use mongodb::bson::Bson;
use std::{fmt, sync::Arc};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{context}: parameter `{parameter}` {message}")]
    ParameterShape {
        parameter: &'static str,
        context: &'static str,
        message: String,
    },
    #[error("{method}() must be called after path() when called with only a value")]
    PathRequired { method: &'static str },
    #[error(transparent)]
    Cast(#[from] CastError),
    #[error("path `{path}` is not in schema and strict mode is enabled")]
    StrictMode { path: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("failed to hydrate record {index}: {message}")]
    Hydration { index: usize, message: String },
    #[error("no document found for query on model `{model}`")]
    DocumentNotFound { model: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(
        parameter: &'static str,
        context: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::ParameterShape {
            parameter,
            context,
            message: message.into(),
        }
    }
}

/// A value that could not be converted to the type its schema path declares.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("cast to {kind} failed for value {value} at path `{path}` for model `{model}`")]
pub struct CastError {
    pub path: String,
    pub value: Bson,
    pub kind: &'static str,
    pub model: &'static str,
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ValidatorError {
    pub kind: String,
    pub path: String,
    pub value: Bson,
    pub message: String,
    pub cause: Option<String>,
}

/// Aggregate of every validator failure found in one validation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationError {
    pub model: &'static str,
    pub errors: Vec<ValidatorError>,
}

impl ValidationError {
    pub fn path(&self, path: &str) -> Option<&ValidatorError> {
        self.errors.iter().find(|error| error.path == path)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation failed", self.model)?;

        for (i, error) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}{}: {}", error.path, error.message)?;
        }

        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Opaque error raised by the driver. Never reinterpreted.
#[derive(Clone, Debug)]
pub struct DriverError(Arc<dyn std::error::Error + Send + Sync>);

impl DriverError {
    pub fn new(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(error))
    }

    pub fn message(message: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Message(String);

        impl fmt::Display for Message {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::error::Error for Message {}

        Self::new(Message(message.into()))
    }

    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(error: mongodb::error::Error) -> Self {
        Self::Driver(DriverError::new(error))
    }
}
