/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::fmt;

use thiserror::Error;

/// The five error kinds from the error-handling design. `NotFound` is the
/// only one the dispatcher treats as "keep trying other strategies"; every
/// other kind is terminal for the current dial.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ConnectionProblem(String),

    #[error("{0}")]
    BadParameter(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_aggregate(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Combine zero or more errors into one. Mirrors `trace.NewAggregate`:
    /// a single cause collapses to itself, no causes is `None`, otherwise an
    /// `Aggregate` carrying every cause in order.
    pub fn aggregate(causes: Vec<Error>) -> Option<Error> {
        let mut causes: Vec<Error> = causes;
        match causes.len() {
            0 => None,
            1 => causes.pop(),
            _ => Some(Error::Aggregate(causes)),
        }
    }

    pub fn connection_problem(msg: impl fmt::Display) -> Error {
        Error::ConnectionProblem(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Error {
        Error::NotFound(msg.to_string())
    }

    pub fn bad_parameter(msg: impl fmt::Display) -> Error {
        Error::BadParameter(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// "Closed network connection" and TLS close-notify-after-close errors are
/// expected during teardown races and shouldn't be logged as failures.
pub fn is_benign_close_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => true,
        _ => {
            let msg = err.to_string();
            msg.contains("use of closed network connection") || msg.contains("close_notify")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_zero_is_none() {
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_of_one_collapses() {
        let err = Error::aggregate(vec![Error::not_found("x")]).unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn aggregate_of_many_joins_messages() {
        let err = Error::aggregate(vec![
            Error::not_found("no tunnel"),
            Error::connection_problem("dial refused"),
        ])
        .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("no tunnel"));
        assert!(msg.contains("dial refused"));
    }
}
