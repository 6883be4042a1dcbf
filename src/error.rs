// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {crate::container::ContainerOpenError, std::path::PathBuf, thiserror::Error};

/// Unified error type for the signing orchestrator core.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("{0}")]
    InputValidation(String),

    #[error("{path}: not a valid container: {source}")]
    UnknownContainer {
        path: PathBuf,
        source: ContainerOpenError,
    },

    #[error("{0}")]
    Signing(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("external utility {utility} exited with status {status}: {stderr}")]
    ExternalUtility {
        utility: String,
        status: i32,
        stderr: String,
    },
}

impl SigningError {
    pub fn input_validation(msg: impl Into<String>) -> Self {
        Self::InputValidation(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }
}
