//! Error types for module host operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, enabling, or disabling modules.
#[derive(Error, Debug)]
pub enum Error {
    /// No active module with this name.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// A module with this name is already active.
    #[error("duplicate module name: {0}")]
    DuplicateModule(String),

    /// The owning module already has a command with this name.
    #[error("duplicate command {command} for module {module}")]
    DuplicateCommand {
        /// Owning module.
        module: String,
        /// Command name.
        command: String,
    },

    /// A declaring class does not satisfy the shape its tag requires.
    #[error("invalid declaration in {class}: {reason}")]
    InvalidDeclaration {
        /// Class name.
        class: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A command declaration names a module that is not active.
    #[error("invalid target for {class}: module {module} is not active")]
    InvalidTarget {
        /// Class name.
        class: String,
        /// Named owning module.
        module: String,
    },

    /// A symbol could not be resolved by any active loading unit.
    #[error("unresolved symbol {symbol} (referenced by {referenced_by})")]
    IsolationViolation {
        /// The name that failed to resolve.
        symbol: String,
        /// Who asked for it.
        referenced_by: String,
    },

    /// A module's teardown hook failed.
    #[error("teardown of {module} failed: {message}")]
    Teardown {
        /// Module name.
        module: String,
        /// Failure message.
        message: String,
    },

    /// A module's enable hook failed.
    #[error("enabling {module} failed: {reason}")]
    EnableFailed {
        /// Module name.
        module: String,
        /// Failure message.
        reason: String,
    },

    /// Module is in the wrong lifecycle state for the operation.
    #[error("invalid module state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The archive's loading unit is already published.
    #[error("archive already loaded: {}", .0.display())]
    ArchiveAlreadyLoaded(PathBuf),

    /// Archive manifest could not be parsed or is malformed.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// A handler for this tag kind exists.
    #[error("tag handler already registered: {0}")]
    HandlerAlreadyRegistered(String),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Host configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure reported by module code.
    #[error("module error: {0}")]
    Module(String),

    /// A worker pool task failed to complete.
    #[error("worker task failed: {0}")]
    Join(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a module not found error.
    pub fn module_not_found(name: impl Into<String>) -> Self {
        Self::ModuleNotFound(name.into())
    }

    /// Create an invalid declaration error.
    pub fn invalid_declaration(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDeclaration {
            class: class.into(),
            reason: reason.into(),
        }
    }

    /// Create an isolation violation error.
    pub fn unresolved(symbol: impl Into<String>, referenced_by: impl Into<String>) -> Self {
        Self::IsolationViolation {
            symbol: symbol.into(),
            referenced_by: referenced_by.into(),
        }
    }

    /// Create an enable failed error.
    pub fn enable_failed(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnableFailed {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Create a teardown error.
    pub fn teardown(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Teardown {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an error from module code.
    pub fn module(msg: impl Into<String>) -> Self {
        Self::Module(msg.into())
    }

    /// Returns true if this error fails a single class without abandoning
    /// the rest of its archive.
    pub fn is_per_class(&self) -> bool {
        matches!(
            self,
            Self::InvalidDeclaration { .. }
                | Self::InvalidTarget { .. }
                | Self::DuplicateCommand { .. }
        )
    }

    /// Returns true if retrying the operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound(_)
                | Self::DuplicateModule(_)
                | Self::InvalidTarget { .. }
                | Self::IsolationViolation { .. }
                | Self::InvalidState { .. }
        )
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
