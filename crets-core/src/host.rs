//! Host platform collaborator
//!
//! The work item form is owned by the host. It tells us which item is open
//! and exposes its field values; nothing else is assumed about it.

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::bridge::now_ms;
use crate::error::HostError;

/// Prefix of identifiers minted for unsaved work items
pub const TEMPORARY_SCOPE_PREFIX: &str = "new_";

/// Field holding the work item type
pub const FIELD_WORK_ITEM_TYPE: &str = "System.WorkItemType";
pub const FIELD_TITLE: &str = "System.Title";

/// Scope identifier the host resolved for the open form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScope {
    pub id: String,
    /// True for an unsaved item that has no permanent id yet
    pub is_temporary: bool,
}

impl ResolvedScope {
    pub fn permanent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_temporary: false,
        }
    }

    /// A freshly generated temporary scope
    pub fn temporary() -> Self {
        Self {
            id: generate_temporary_scope_id(),
            is_temporary: true,
        }
    }
}

/// Access to the host's work item form service
pub trait HostBridge {
    /// Identifier of the open work item, or a temporary one for a new item
    fn resolve_active_scope(&self) -> Result<ResolvedScope, HostError>;

    /// Values of the named fields; unknown fields are left out
    fn field_values(&self, names: &[&str]) -> Result<HashMap<String, Value>, HostError>;
}

/// `new_<epoch-ms>_<8 random hex chars>`
pub fn generate_temporary_scope_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}{}_{}", TEMPORARY_SCOPE_PREFIX, now_ms(), &random[..8])
}

pub fn is_temporary_scope_id(id: &str) -> bool {
    id.starts_with(TEMPORARY_SCOPE_PREFIX)
}

/// Host with fixed answers, used by the CLI and tests
#[derive(Debug, Clone, Default)]
pub struct StaticHost {
    scope: Option<ResolvedScope>,
    fields: HashMap<String, Value>,
}

impl StaticHost {
    /// Host for an existing work item
    pub fn existing(id: impl Into<String>) -> Self {
        Self {
            scope: Some(ResolvedScope::permanent(id)),
            fields: HashMap::new(),
        }
    }

    /// Host for a new, unsaved work item
    pub fn new_item() -> Self {
        Self {
            scope: Some(ResolvedScope::temporary()),
            fields: HashMap::new(),
        }
    }

    /// Host that is not showing a work item
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

impl HostBridge for StaticHost {
    fn resolve_active_scope(&self) -> Result<ResolvedScope, HostError> {
        self.scope.clone().ok_or(HostError::NoWorkItem)
    }

    fn field_values(&self, names: &[&str]) -> Result<HashMap<String, Value>, HostError> {
        if self.scope.is_none() {
            return Err(HostError::NoWorkItem);
        }
        Ok(names
            .iter()
            .filter_map(|name| {
                self.fields
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect())
    }
}
