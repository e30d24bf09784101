//! Write-time validation results, one per harvested record.

use crate::ids::{record_id, RuleId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Outcome of applying one rule to one record.
///
/// Occurrence lists are only captured when detailed diagnostics are enabled;
/// otherwise both stay empty and the rule expands into a single fact row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleFact {
    pub rule_id: RuleId,
    pub is_valid: bool,
    #[serde(default)]
    pub valid_occurrences: Vec<String>,
    #[serde(default)]
    pub invalid_occurrences: Vec<String>,
}

impl RuleFact {
    pub fn new(rule_id: RuleId, is_valid: bool) -> Self {
        Self {
            rule_id,
            is_valid,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_valid_occurrences<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.valid_occurrences = values.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_invalid_occurrences<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalid_occurrences = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_occurrences(&self) -> bool {
        !self.valid_occurrences.is_empty() || !self.invalid_occurrences.is_empty()
    }
}

/// Validation result of one harvested record within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordValidation {
    pub identifier: String,
    pub record_id: String,
    pub record_is_valid: bool,
    pub is_transformed: bool,
    /// Last modification reported by the OAI-PMH header.
    #[serde(default)]
    pub datestamp: Option<NaiveDateTime>,
    /// Hash of the metadata document published for this record, if any.
    #[serde(default)]
    pub published_metadata_hash: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default)]
    pub set_spec: Option<String>,
    pub rules: Vec<RuleFact>,
}

impl RecordValidation {
    /// Build a record result; the record id is derived from `identifier`.
    pub fn new(identifier: impl Into<String>, record_is_valid: bool, is_transformed: bool) -> Self {
        let identifier = identifier.into();
        Self {
            record_id: record_id(&identifier),
            identifier,
            record_is_valid,
            is_transformed,
            datestamp: None,
            published_metadata_hash: None,
            repository: None,
            institution: None,
            set_spec: None,
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_datestamp(mut self, datestamp: NaiveDateTime) -> Self {
        self.datestamp = Some(datestamp);
        self
    }

    #[must_use]
    pub fn with_published_metadata_hash(mut self, hash: impl Into<String>) -> Self {
        self.published_metadata_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    #[must_use]
    pub fn with_institution(mut self, institution: impl Into<String>) -> Self {
        self.institution = Some(institution.into());
        self
    }

    #[must_use]
    pub fn with_set_spec(mut self, set_spec: impl Into<String>) -> Self {
        self.set_spec = Some(set_spec.into());
        self
    }

    #[must_use]
    pub fn with_rule(mut self, fact: RuleFact) -> Self {
        self.rules.push(fact);
        self
    }

    pub fn valid_rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rules.iter().filter(|r| r.is_valid).map(|r| r.rule_id)
    }

    pub fn invalid_rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rules.iter().filter(|r| !r.is_valid).map(|r| r.rule_id)
    }
}
