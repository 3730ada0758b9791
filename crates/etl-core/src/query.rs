use crate::error::{EtlError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder replaced by the restriction value inside a template.
pub const VALUE_PLACEHOLDER: &str = "${VALUE}";

// ---------------------------------------------------------------------------
// Restriction
// ---------------------------------------------------------------------------

/// Kinds of restriction the overseer knows how to fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Restriction {
    StartDate,
    EndDate,
    LastModifiedStartDate,
    LastModifiedEndDate,
    IncludeOnlyResourceCodes,
    ExcludeResourceCodes,
}

impl Restriction {
    pub fn all() -> &'static [Restriction] {
        &[
            Restriction::StartDate,
            Restriction::EndDate,
            Restriction::LastModifiedStartDate,
            Restriction::LastModifiedEndDate,
            Restriction::IncludeOnlyResourceCodes,
            Restriction::ExcludeResourceCodes,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Restriction::StartDate => "start_date",
            Restriction::EndDate => "end_date",
            Restriction::LastModifiedStartDate => "last_modified_start_date",
            Restriction::LastModifiedEndDate => "last_modified_end_date",
            Restriction::IncludeOnlyResourceCodes => "include_only_resource_codes",
            Restriction::ExcludeResourceCodes => "exclude_resource_codes",
        }
    }

    pub fn from_key(key: &str) -> Option<Restriction> {
        Restriction::all().iter().copied().find(|r| r.as_str() == key)
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// The restriction side of a query definition: templates declared under
/// `overseer_restrictions`, and the concrete clauses filled in for the
/// current chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    templates: Vec<(String, String)>,
    applied: BTreeMap<Restriction, String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `overseer_restrictions` from a query definition. A definition
    /// without the key has no restrictions.
    pub fn from_definition(definition: &Value) -> Result<Self> {
        let mut query = Query::new();
        let Some(restrictions) = definition.get("overseer_restrictions") else {
            return Ok(query);
        };
        let map = restrictions.as_object().ok_or_else(|| {
            EtlError::ConfigInvalid("overseer_restrictions must be an object".into())
        })?;
        for (key, template) in map {
            let template = template.as_str().ok_or_else(|| {
                EtlError::ConfigInvalid(format!("overseer restriction '{key}' must be a string"))
            })?;
            query.add_restriction_template(key, template);
        }
        Ok(query)
    }

    pub fn add_restriction_template(&mut self, key: &str, template: &str) {
        match self.templates.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = template.to_string(),
            None => self.templates.push((key.to_string(), template.to_string())),
        }
    }

    pub fn restriction_templates(&self) -> &[(String, String)] {
        &self.templates
    }

    pub fn set_restriction(&mut self, restriction: Restriction, clause: String) {
        self.applied.insert(restriction, clause);
    }

    pub fn restriction(&self, restriction: Restriction) -> Option<&str> {
        self.applied.get(&restriction).map(String::as_str)
    }

    pub fn restrictions(&self) -> impl Iterator<Item = (Restriction, &str)> {
        self.applied.iter().map(|(r, c)| (*r, c.as_str()))
    }

    /// Forget the clauses of the previous chunk.
    pub fn clear_restrictions(&mut self) {
        self.applied.clear();
    }

    /// Applied clauses joined with `AND`, or `None` when nothing applies.
    pub fn where_clause(&self) -> Option<String> {
        if self.applied.is_empty() {
            return None;
        }
        Some(
            self.applied
                .values()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" AND "),
        )
    }
}
