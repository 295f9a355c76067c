//! Core domain types for Keep.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. The conversation engine in `keep-context` builds on these.

mod ids;
mod limits;
mod message;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ids::{SessionId, TurnId};
pub use limits::{ContextBudget, ModelLimits};
pub use message::{
    AssistantMessage, Message, MessageError, SystemMessage, ToolCall, ToolMessage, UserMessage,
};

/// A string that is guaranteed non-empty (after trimming) by construction.
///
/// Message variants that require content hold one of these, so "content may
/// be empty" is a type-level impossibility rather than a runtime check
/// scattered across call sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyString(String);

#[derive(Debug, Error)]
#[error("message content must not be empty")]
pub struct EmptyStringError;

impl NonEmptyString {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyStringError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyStringError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl TryFrom<String> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::fmt::Display for NonEmptyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
