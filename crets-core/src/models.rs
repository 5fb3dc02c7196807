use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separator used in hierarchical requirement codes ("Mod.1.1.")
pub const ID_SEPARATOR: char = '.';

/// Normalizes a requirement identifier for comparison.
///
/// Catalog data mixes `"Mod.1"` and `"Mod.1."` for the same node, so every
/// identifier comparison in the crate goes through here.
pub fn normalize_id(id: &str) -> &str {
    id.trim_end_matches(ID_SEPARATOR)
}

/// Returns true if both identifiers refer to the same requirement
pub fn ids_match(a: &str, b: &str) -> bool {
    normalize_id(a) == normalize_id(b)
}

/// Descriptive text of a requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequirementAttrs {
    /// Display text (required)
    #[serde(default)]
    pub detail: String,

    #[serde(
        rename = "Justification",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub justification: Option<String>,

    #[serde(rename = "Discussion", default, skip_serializing_if = "Option::is_none")]
    pub discussion: Option<String>,

    /// Catalog columns we don't interpret (e.g. "Id"), kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A sustainability requirement, either a catalog entry or a copy of one
/// applied to a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Hierarchical identifier (e.g. "Mod.1.1")
    pub id: String,

    /// Human-readable dotted code, may carry a trailing separator
    #[serde(default)]
    pub display_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Advisory child list; may disagree with `parent_id` links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,

    #[serde(default)]
    pub attrs: RequirementAttrs,

    /// Set when the work item carries a local edit of this requirement
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_modified: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<DateTime<Utc>>,

    /// Pre-edit copy, owned by the modified record and used only by restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_snapshot: Option<Box<Requirement>>,

    /// Fields from the source catalog that are not modelled (level, _meta, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Requirement {
    /// Creates a requirement with the given identifier and detail text
    pub fn new(id: impl Into<String>, detail: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_code: format!("{}{}", normalize_id(&id), ID_SEPARATOR),
            id,
            parent_id: None,
            children: None,
            attrs: RequirementAttrs {
                detail: detail.into(),
                ..Default::default()
            },
            is_modified: false,
            modified_date: None,
            original_snapshot: None,
            extra: Map::new(),
        }
    }

    /// Builder-style helper to set the parent reference
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Builder-style helper to set the advisory child list
    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = Some(children.into_iter().map(Into::into).collect());
        self
    }

    /// Code shown to users; falls back to the id when the catalog left it blank
    pub fn code(&self) -> &str {
        if self.display_code.is_empty() {
            &self.id
        } else {
            &self.display_code
        }
    }

    /// Returns true if this record's id matches `id` after normalization
    pub fn is(&self, id: &str) -> bool {
        ids_match(&self.id, id)
    }

    /// Checks the fields the catalog requires of every entry
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id must not be empty".to_string());
        }
        if self.display_code.trim().is_empty() {
            return Err(format!("{}: displayCode must not be empty", self.id));
        }
        if self.attrs.detail.trim().is_empty() {
            return Err(format!("{}: attrs.detail must not be empty", self.id));
        }
        Ok(())
    }
}

/// Item-local edit of a requirement's descriptive fields.
/// `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequirementEdit {
    pub detail: Option<String>,
    pub justification: Option<String>,
    pub discussion: Option<String>,
}

impl RequirementEdit {
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detail.is_none() && self.justification.is_none() && self.discussion.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id_trims_trailing_separators() {
        assert_eq!(normalize_id("Mod.1."), "Mod.1");
        assert_eq!(normalize_id("Mod.1.."), "Mod.1");
        assert_eq!(normalize_id("Mod.1"), "Mod.1");
        assert!(ids_match("Mod.1.", "Mod.1"));
        assert!(!ids_match("Mod.1", "Mod.11"));
    }

    #[test]
    fn test_catalog_entry_preserves_unknown_fields() {
        let json = r#"{
            "id": "Mod.1",
            "displayCode": "Mod.1.",
            "parentId": "Mod",
            "children": ["Mod.1.1"],
            "level": 2,
            "attrs": {"Id": "Mod.1.", "detail": "Compatibilidad", "Justification": "J"},
            "_meta": {"source_file": "x.csv"}
        }"#;
        let req: Requirement = serde_json::from_str(json).unwrap();
        assert_eq!(req.parent_id.as_deref(), Some("Mod"));
        assert_eq!(req.attrs.justification.as_deref(), Some("J"));
        assert!(!req.is_modified);

        let back: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(back["level"], 2);
        assert_eq!(back["attrs"]["Id"], "Mod.1.");
        assert_eq!(back["_meta"]["source_file"], "x.csv");
        assert!(back.get("isModified").is_none());
        assert!(back.get("originalSnapshot").is_none());
    }

    #[test]
    fn test_validate() {
        assert!(Requirement::new("A.1", "detail").validate().is_ok());
        assert!(Requirement::new("A.1", "  ").validate().is_err());
        let mut req = Requirement::new("A.1", "detail");
        req.display_code.clear();
        assert!(req.validate().is_err());
        assert_eq!(req.code(), "A.1");
    }
}
