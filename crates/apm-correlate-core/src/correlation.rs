//! Correlation records and the operations that can be performed on them

use serde::{Deserialize, Serialize};
use std::fmt;

/// An association between a dimension of a monitored entity and a typed
/// property value (for example `host=web-1` correlated to `service=checkout`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correlation {
    /// Dimension name, e.g. `host` or `kubernetes_pod_uid`
    pub dim_name: String,

    /// Dimension value identifying the entity
    pub dim_value: String,

    /// Correlated property type, e.g. `service` or `environment`
    #[serde(rename = "type")]
    pub corr_type: String,

    /// Correlated property value
    pub value: String,
}

impl Correlation {
    pub fn new(
        dim_name: impl Into<String>,
        dim_value: impl Into<String>,
        corr_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            dim_name: dim_name.into(),
            dim_value: dim_value.into(),
            corr_type: corr_type.into(),
            value: value.into(),
        }
    }

    /// Lookup key for every correlation of a dimension
    pub fn for_dimension(dim_name: impl Into<String>, dim_value: impl Into<String>) -> Self {
        Self {
            dim_name: dim_name.into(),
            dim_value: dim_value.into(),
            ..Default::default()
        }
    }

    /// Both the dimension name and value are present
    pub fn has_dimension(&self) -> bool {
        !self.dim_name.is_empty() && !self.dim_value.is_empty()
    }
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.dim_name, self.dim_value)?;
        if !self.corr_type.is_empty() {
            write!(f, " {}={}", self.corr_type, self.value)?;
        }
        Ok(())
    }
}

/// Operation carried by a correlation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create or replace a correlation (PUT)
    Upsert,
    /// Remove a correlation (DELETE)
    Delete,
    /// Fetch all correlations of a dimension (GET)
    Lookup,
}

impl Operation {
    /// HTTP method name used on the wire
    pub fn method(self) -> &'static str {
        match self {
            Operation::Upsert => "PUT",
            Operation::Delete => "DELETE",
            Operation::Lookup => "GET",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Identifies "the same logical work" for deduplication.
///
/// The correlated value is deliberately absent: two upserts for the same
/// property of the same dimension collide even if they carry different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub operation: Operation,
    pub dim_name: String,
    pub dim_value: String,
    pub corr_type: String,
}

impl DedupKey {
    pub fn new(operation: Operation, correlation: &Correlation) -> Self {
        Self {
            operation,
            dim_name: correlation.dim_name.clone(),
            dim_value: correlation.dim_value.clone(),
            corr_type: correlation.corr_type.clone(),
        }
    }
}
