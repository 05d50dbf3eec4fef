use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::config::InstanceValidationError;

/// The hypervisor host is missing something fabriclab needs before it can do
/// any work.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentError {
    #[error("Required directory not found: '{path}'")]
    MissingDirectory { path: String },
    #[error("Required binary '{binary}' not found")]
    MissingBinary { binary: String },
}

/// User provided input was invalid.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("Failed to load configuration file from '{path}'")]
    LoadConfiguration { path: String },
    #[error("Failed to parse configuration")]
    ParseConfiguration,
    #[error("Invalid hypervisor configuration: {reason}")]
    InvalidConfiguration { reason: String },
    #[error("Invalid instance descriptor: {0}")]
    InvalidInstance(#[from] InstanceValidationError),
    #[error("Instance {id} already exists")]
    AlreadyExists { id: u32 },
    #[error("Instance {id} does not exist")]
    InstanceNotFound { id: u32 },
}

/// No installable disk image could be selected.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ImageNotFoundError {
    #[error("No images matching '{pattern}' found in '{directory}'")]
    NoImages { directory: String, pattern: String },
    #[error("Image version '{version}' not found, available: {}", .available.join(", "))]
    VersionNotFound {
        version: String,
        available: Vec<String>,
    },
}

/// A step of the provisioning workflow failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningError {
    #[error("Failed to execute '{binary}'")]
    CommandCouldNotExecute { binary: String },
    #[error("Command '{command}' failed, {binary} {explanation}")]
    CommandFailed {
        binary: String,
        command: String,
        explanation: String,
    },
    #[error("Disk import for instance {id} did not complete within {timeout_secs} seconds")]
    ImportTimeout { id: u32, timeout_secs: u64 },
    #[error("Could not find imported disk of instance {id} to attach")]
    DiskDiscovery { id: u32 },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Fabriclab panicked: {0}")]
    Panic(String),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
/// Categories are meant to tell the user where to look: the host, their own
/// input, the image directory, or the hypervisor itself.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// The hypervisor host is not set up the way fabriclab expects.
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    /// Fabriclab was given invalid input.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// No matching disk image was found.
    #[error(transparent)]
    ImageNotFound(#[from] ImageNotFoundError),

    /// An operation against the hypervisor failed or never completed.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// A bug in fabriclab.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct FabricErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct FabricError(Box<FabricErrorInner>);
impl FabricError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        FabricError(Box::new(FabricErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        FabricError(Box::new(FabricErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(message: &'static str) -> Self {
        Self::new(InternalError::Internal(message))
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured FabricError.
    fn structured(self, kind: K) -> Result<T, FabricError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, FabricError> {
        match self {
            Some(t) => Ok(t),
            None => Err(FabricError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, FabricError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(FabricError::with_source(kind, e.into())),
        }
    }
}

pub trait FabricResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, FabricError>;
}

impl<T> FabricResultExt<T> for Result<T, FabricError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, FabricError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for FabricError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("fabriclab-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Environment(ref e) => state.serialize_field("error", e)?,
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::ImageNotFound(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Provisioning(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for FabricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
