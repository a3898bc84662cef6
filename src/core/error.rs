// Structured error shared by the pool, packages, registry and dispatcher.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    AlreadyExists,
    Busy,
    Io,
    Compile,
    Script,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    package: Option<String>,
    path: Option<PathBuf>,
    hint: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            package: None,
            path: None,
            hint: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Wraps an inner error as the source of a new, outer one.
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, inner: Error) -> Self {
        Self::new(kind).with_message(message).with_source(inner)
    }

    /// Message followed by every cause in the source chain, `: `-separated.
    pub fn chain_message(&self) -> String {
        let mut out = self.to_string();
        let mut cur = self.source();
        while let Some(source) = cur {
            out.push_str(": ");
            out.push_str(&source.to_string());
            cur = source.source();
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}")?,
            None => write!(f, "{:?}", self.kind)?,
        }
        if let Some(package) = &self.package {
            write!(f, " (package: {package})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::Busy => 5,
        ErrorKind::Io => 6,
        ErrorKind::Compile => 7,
        ErrorKind::Script => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::AlreadyExists, 4),
            (ErrorKind::Busy, 5),
            (ErrorKind::Io, 6),
            (ErrorKind::Compile, 7),
            (ErrorKind::Script, 8),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_appends_package_and_path() {
        let err = Error::new(ErrorKind::Compile)
            .with_message("failed to load package")
            .with_package("calc")
            .with_path("/srv/packages/calc");
        assert_eq!(
            err.to_string(),
            "failed to load package (package: calc) (path: /srv/packages/calc)"
        );
    }

    #[test]
    fn chain_message_walks_sources() {
        let inner = Error::new(ErrorKind::Compile).with_message("syntax error");
        let err = Error::wrap(ErrorKind::Compile, "failed to compile file", inner);
        assert_eq!(err.chain_message(), "failed to compile file: syntax error");
    }

    #[test]
    fn display_falls_back_to_kind() {
        let err = Error::new(ErrorKind::Busy);
        assert_eq!(err.to_string(), "Busy");
    }
}
