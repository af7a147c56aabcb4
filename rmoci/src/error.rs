use reqwest::StatusCode;

/// Error kinds shared by every driver and the sync engine. Variants are the
/// taxonomy callers match on; wrapped errors keep their payload for logging.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    InvalidInput(String),
    MissingInput(String),
    UnsupportedConfigVersion(i64),
    Canceled,
    NotFound(String),
    NotImplemented(&'static str),
    InvalidReference(String),
    DigestMismatch,
    SizeMismatch,
    ShortRead,
    SizeLimitExceeded(u64),
    UnsupportedMediaType(String),
    UnsupportedApi(String),
    ParseError(String),
    MissingTag,
    MissingDigest,
    FileDeleted,
    FileNotFound(String),
    StatusNotOk(StatusCode),
    Io(#[from] std::io::Error),
    Http(#[from] reqwest::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    Json(#[from] serde_json::Error),
    Template(String),
    Multiple(Vec<Error>),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    /// True for cancellation, including a join made up entirely of
    /// cancellations. Shutdown must never be treated as a step failure.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled => true,
            Error::Multiple(errs) => !errs.is_empty() && errs.iter().all(|e| e.is_canceled()),
            _ => false,
        }
    }

    /// Collapse accumulated loop errors. Empty means success.
    pub fn join(mut errs: Vec<Error>) -> Result<(), Error> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Error::Multiple(errs)),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert!(Error::join(vec![]).is_ok());
        assert!(matches!(
            Error::join(vec![Error::MissingTag]),
            Err(Error::MissingTag)
        ));
        let e = Error::join(vec![Error::MissingTag, Error::Canceled]).unwrap_err();
        assert!(matches!(&e, Error::Multiple(v) if v.len() == 2));
        assert!(!e.is_canceled());
    }

    #[test]
    fn test_is_canceled() {
        assert!(Error::Canceled.is_canceled());
        assert!(Error::Multiple(vec![Error::Canceled, Error::Canceled]).is_canceled());
        assert!(!Error::Multiple(vec![]).is_canceled());
        assert!(!Error::MissingDigest.is_canceled());
    }
}
