// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TridentError>;

#[derive(Error, Debug)]
pub enum TridentError {
    #[error("os i/o error: {0}")]
    IoError(#[from] io::Error),
    /// The operation is not meaningful for this iterator or component.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// A configured capacity (files, sessions, cache slots) is used up. The
    /// caller may retry with larger limits.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    /// A caller broke an ordering or state precondition, e.g. seeking backwards
    /// or advancing an exhausted iterator.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),
}

impl TridentError {
    pub(crate) fn corrupt<S: Into<String>>(msg: S) -> Self {
        TridentError::CorruptData(msg.into())
    }

    pub(crate) fn misuse<S: Into<String>>(msg: S) -> Self {
        TridentError::ProtocolMisuse(msg.into())
    }

    pub(crate) fn exhausted<S: Into<String>>(msg: S) -> Self {
        TridentError::ResourceExhausted(msg.into())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, TridentError::Unsupported(_))
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self, TridentError::ProtocolMisuse(_))
    }
}
