use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use error_stack::{AttachmentKind, Context, FrameKind, Report};
use itertools::Itertools;
use valuable::Valuable;

/// Flattened view of an error-stack report that can be attached to tracing events as a structured value.
#[derive(Valuable, PartialEq, Debug, Default)]
pub struct LoggableError {
    pub msg: String,
    pub attachments: Vec<String>,
    pub location: String,
    pub cause: Option<Box<LoggableError>>,
}

impl Display for LoggableError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)?;

        if !self.attachments.is_empty() {
            write!(f, " ({})", self.attachments.iter().join(", "))?;
        }

        match &self.cause {
            Some(cause) => write!(f, ": {}", cause),
            None => Ok(()),
        }
    }
}

impl std::error::Error for LoggableError {}

impl<T> From<&Report<T>> for LoggableError {
    fn from(report: &Report<T>) -> Self {
        let mut frames = VecDeque::from_iter(report.frames());
        let mut errors = Vec::new();

        // frames of one context come first as attachments (newest to oldest) and end with the context itself
        while !frames.is_empty() {
            let mut error = LoggableError::default();

            while let Some(frame) = frames.pop_front() {
                match frame.kind() {
                    FrameKind::Context(context) => {
                        error.msg = context.to_string();
                        break;
                    }
                    FrameKind::Attachment(AttachmentKind::Printable(printable)) => {
                        error.attachments.push(printable.to_string())
                    }
                    FrameKind::Attachment(_) => {
                        if let Some(location) = frame.downcast_ref::<std::panic::Location>() {
                            error.location = location.to_string();
                        }
                    }
                }
            }

            error.attachments.reverse();
            errors.push(error);
        }

        errors
            .into_iter()
            .rev()
            .fold(None, |cause: Option<LoggableError>, mut error| {
                error.cause = cause.map(Box::new);
                Some(error)
            })
            .unwrap_or_default()
    }
}

/// Adds `another_err` to the errors already collected in `result`.
pub fn extend_err<T, E>(
    result: error_stack::Result<T, E>,
    another_err: Report<E>,
) -> error_stack::Result<T, E>
where
    E: Context,
{
    match result {
        Err(mut report) => {
            report.extend_one(another_err);
            Err(report)
        }
        Ok(_) => Err(another_err),
    }
}

/// Folds a sequence of unit results into a single result that carries every error.
pub fn collect_errors<E, I>(results: I) -> error_stack::Result<(), E>
where
    E: Context,
    I: IntoIterator<Item = error_stack::Result<(), E>>,
{
    results
        .into_iter()
        .fold(Ok(()), |acc, result| match result {
            Ok(()) => acc,
            Err(err) => extend_err(acc, err),
        })
}
