//! AI model catalogue entries. The core only reads these.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::value_objects::{DomainError, ModelId};

/// Publication status of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Available to users
    Open,
    /// Withdrawn
    Closed,
    /// Not yet published
    Draft,
}

impl ModelStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Open => "open",
            ModelStatus::Closed => "closed",
            ModelStatus::Draft => "draft",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ModelStatus::Open),
            "closed" => Ok(ModelStatus::Closed),
            "draft" => Ok(ModelStatus::Draft),
            other => Err(DomainError::unknown("model status", other)),
        }
    }
}

/// A priced generation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiModel {
    /// Model id
    pub id: ModelId,
    /// Display name
    pub name: String,
    /// Vendor endpoint URL
    pub url: String,
    /// Price charged per task (non-negative)
    pub price: Decimal,
    /// Publication status
    pub status: ModelStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Data required to register a model.
#[derive(Debug, Clone)]
pub struct NewModel {
    /// Display name
    pub name: String,
    /// Vendor endpoint URL
    pub url: String,
    /// Price charged per task
    pub price: Decimal,
    /// Publication status
    pub status: ModelStatus,
}

impl NewModel {
    /// An open model.
    pub fn open(name: impl Into<String>, url: impl Into<String>, price: Decimal) -> Self {
        Self { name: name.into(), url: url.into(), price, status: ModelStatus::Open }
    }

    /// Validate the price constraint.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.price.is_sign_negative() {
            return Err(DomainError::InvalidAmount("model price must be non-negative".to_string()));
        }
        Ok(())
    }
}
