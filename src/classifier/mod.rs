use std::io::{self, ErrorKind};

use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery cancelled")]
    Cancelled,
    #[error("delivery deadline exceeded")]
    DeadlineExceeded,
    #[error("destination rejected the payload: {0}")]
    Rejected(String),
    #[error("destination temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("destination is rate limiting")]
    RateLimited,
    #[error("write timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Transient,
    Fatal,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &DeliveryError) -> Severity;

    fn is_fatal(&self, err: &DeliveryError) -> bool {
        self.classify(err) == Severity::Fatal
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ErrorClassifiers {
    #[default]
    StopOnCancel,
    StopOnRejection,
    NeverStop,
}

impl ErrorClassifier for ErrorClassifiers {
    fn classify(&self, err: &DeliveryError) -> Severity {
        match self {
            ErrorClassifiers::StopOnCancel => stop_on_cancel(err),
            ErrorClassifiers::StopOnRejection => stop_on_rejection(err),
            ErrorClassifiers::NeverStop => Severity::Transient,
        }
    }
}

fn stop_on_cancel(err: &DeliveryError) -> Severity {
    match err {
        DeliveryError::Cancelled | DeliveryError::DeadlineExceeded => Severity::Fatal,
        _ => Severity::Transient,
    }
}

fn stop_on_rejection(err: &DeliveryError) -> Severity {
    match err {
        DeliveryError::Rejected(_) => Severity::Fatal,
        DeliveryError::Io(io_err) if io_err.kind() == ErrorKind::PermissionDenied => Severity::Fatal,
        _ => stop_on_cancel(err),
    }
}

#[cfg(test)]
mod classifier_tests {
    use std::io::{self, ErrorKind};

    use crate::classifier::{DeliveryError, ErrorClassifier, ErrorClassifiers, Severity};

    fn all_errors() -> Vec<DeliveryError> {
        vec![
            DeliveryError::Cancelled,
            DeliveryError::DeadlineExceeded,
            DeliveryError::Rejected("api key revoked".to_owned()),
            DeliveryError::Unavailable("503".to_owned()),
            DeliveryError::RateLimited,
            DeliveryError::Timeout,
            DeliveryError::Io(io::Error::from(ErrorKind::ConnectionReset)),
            DeliveryError::Io(io::Error::from(ErrorKind::PermissionDenied)),
        ]
    }

    #[test]
    fn test_stop_on_cancel() {
        let classifier = ErrorClassifiers::default();
        let fatal = all_errors()
            .iter()
            .map(|err| classifier.is_fatal(err))
            .collect::<Vec<_>>();

        assert_eq!(fatal, vec![true, true, false, false, false, false, false, false]);
    }

    #[test]
    fn test_stop_on_rejection() {
        let classifier = ErrorClassifiers::StopOnRejection;
        let fatal = all_errors()
            .iter()
            .map(|err| classifier.is_fatal(err))
            .collect::<Vec<_>>();

        assert_eq!(fatal, vec![true, true, true, false, false, false, false, true]);
    }

    #[test]
    fn test_never_stop() {
        let classifier = ErrorClassifiers::NeverStop;
        assert!(
            all_errors()
                .iter()
                .all(|err| classifier.classify(err) == Severity::Transient)
        );
    }

    #[test]
    fn test_parse_from_name() {
        assert_eq!("stop_on_rejection".parse(), Ok(ErrorClassifiers::StopOnRejection));
        assert_eq!("NEVER_STOP".parse(), Ok(ErrorClassifiers::NeverStop));
        assert!("sometimes".parse::<ErrorClassifiers>().is_err());
        assert_eq!(ErrorClassifiers::default().to_string(), "stop_on_cancel");
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ErrorClassifiers::StopOnRejection;
        let err = DeliveryError::Rejected("gone".to_owned());
        assert_eq!(classifier.classify(&err), classifier.classify(&err));
    }
}
