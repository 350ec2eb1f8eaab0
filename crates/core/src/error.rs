//! Error taxonomy shared across the workspace.

/// Failures reported by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// Failures of the object normalizer.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("failed to unmarshal manifest: {0}")]
    Parse(String),
    #[error("failed to marshal object: {0}")]
    Encode(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("decoding {kind}: {message}")]
    Decode { kind: String, message: String },
}

/// Outcome classes of a reconcile pass.
///
/// Everything except [`Error::Transport`] is a business failure that ends up
/// on the instance status; transport failures go back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("render: {0}")]
    Render(String),
    #[error("apply {object}: {source}")]
    Apply {
        object: String,
        #[source]
        source: StoreError,
    },
    #[error("template {0} not found")]
    TemplateNotFound(String),
    #[error("transport: {0}")]
    Transport(#[source] StoreError),
}

impl Error {
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Text recorded as an instance's failure reason. Render failures carry
    /// the renderer's (or chart engine's) message unchanged.
    pub fn reason(&self) -> String {
        match self {
            Error::Render(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ConvertError> for Error {
    fn from(e: ConvertError) -> Self {
        Error::Render(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_transport() {
        assert!(Error::Transport(StoreError::Transport("eof".into())).is_transport());
        assert!(!Error::Render("boom".into()).is_transport());
        assert!(!Error::Apply { object: "v1/Pod a".into(), source: StoreError::Transport("eof".into()) }.is_transport());
    }

    #[test]
    fn messages_are_human_readable() {
        let e = Error::Apply { object: "v1/Pod test/web".into(), source: StoreError::Conflict("rv 3 != 4".into()) };
        assert_eq!(e.to_string(), "apply v1/Pod test/web: conflict: rv 3 != 4");
        let e: Error = ConvertError::Parse("bad indent".into()).into();
        assert_eq!(e.to_string(), "render: failed to unmarshal manifest: bad indent");
    }

    #[test]
    fn render_reasons_are_verbatim() {
        assert_eq!(Error::Render("TestError".into()).reason(), "TestError");
        assert_eq!(Error::TemplateNotFound("web".into()).reason(), "template web not found");
        assert_eq!(Error::Configuration("both set".into()).reason(), "configuration: both set");
    }
}
