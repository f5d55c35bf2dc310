// Copyright (c) 2024 The QuicRecovery Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for recovery operations.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Recovery engine error.
///
/// Duplicate ACKs, stale ACK frames and ACKs for dropped packet number
/// spaces are not errors; they are expected network behavior and handled as
/// no-ops. Only genuine peer misbehavior (`ProtocolViolation`) and contract
/// violations by the caller (`InvalidState`) surface through this type.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// An endpoint uses this with CONNECTION_CLOSE to signal that the
    /// connection is being closed abruptly in the absence of any error.
    #[default]
    NoError,

    /// The endpoint encountered an internal error and cannot continue with
    /// the connection.
    InternalError,

    /// The peer acknowledged a packet number that was never sent, or sent a
    /// packet number that violates the replay window of its packet number
    /// space. The caller must close the connection.
    ProtocolViolation,

    /* Note: Private error codes are as follows */
    /// There is no more work to do.
    Done,

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The configuration is invalid.
    InvalidConfig(String),
}

impl Error {
    /// Return the wire value of the error.
    /// See RFC 9000 Section 22.5
    pub fn to_wire(&self) -> u64 {
        match *self {
            Error::NoError => 0x0,
            Error::InternalError => 0x1,
            Error::ProtocolViolation => 0x0a,
            _ => 0x0,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_to_wire() {
        let mut found_internal_err = false;
        for err in Error::iter() {
            if err == Error::NoError {
                assert_eq!(err.to_wire(), 0);
                continue;
            }
            if err == Error::Done {
                found_internal_err = true;
            }
            if found_internal_err {
                assert_eq!(err.to_wire(), 0);
                continue;
            }
            assert!(err.to_wire() > 0);
        }
    }

    #[test]
    fn error_display() {
        use std::error::Error;
        let e = super::Error::InvalidState("retry after confirmation".into());
        assert_eq!(
            format!("{}", e),
            "InvalidState(\"retry after confirmation\")"
        );
        assert!(e.source().is_none());
    }
}
