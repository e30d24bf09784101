//! Record-level view of fact rows.

use crate::schema::FactRow;
use harvest_types::{RecordValidation, RuleFact, RuleId};
use serde::Serialize;

/// All fact rows of one record, in the order they were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFacts {
    pub identifier: String,
    pub record_is_valid: bool,
    pub is_transformed: bool,
    pub network: String,
    pub repository: Option<String>,
    pub institution: Option<String>,
    pub set_spec: Option<String>,
    pub rows: Vec<FactRow>,
}

impl RecordFacts {
    /// Start a record from its first row.
    pub fn from_first_row(row: FactRow) -> Self {
        Self {
            identifier: row.identifier.clone(),
            record_is_valid: row.record_is_valid,
            is_transformed: row.is_transformed,
            network: row.network.clone(),
            repository: row.repository.clone(),
            institution: row.institution.clone(),
            set_spec: row.set_spec.clone(),
            rows: vec![row],
        }
    }

    pub fn owns(&self, row: &FactRow) -> bool {
        row.identifier == self.identifier
    }

    fn rule_rows(&self) -> impl Iterator<Item = &FactRow> {
        self.rows.iter().filter(|r| r.is_rule_row())
    }

    pub fn valid_rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rule_rows().filter(|r| r.is_valid).map(|r| r.rule_id)
    }

    pub fn invalid_rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rule_rows().filter(|r| !r.is_valid).map(|r| r.rule_id)
    }

    pub fn has_rule(&self, rule_id: RuleId, is_valid: Option<bool>) -> bool {
        self.rule_rows()
            .any(|r| r.rule_id == rule_id && is_valid.map_or(true, |v| r.is_valid == v))
    }

    /// Rebuild the write-time record result from the stored rows.
    pub fn to_record_validation(&self) -> RecordValidation {
        let mut record =
            RecordValidation::new(self.identifier.clone(), self.record_is_valid, self.is_transformed);
        record.repository = self.repository.clone();
        record.institution = self.institution.clone();
        record.set_spec = self.set_spec.clone();

        for row in self.rule_rows() {
            record.rules.push(RuleFact::new(row.rule_id, row.is_valid));
        }
        for row in self.rows.iter().filter(|r| !r.is_rule_row()) {
            let Some(fact) = record.rules.iter_mut().find(|f| f.rule_id == row.rule_id) else {
                continue;
            };
            let value = row.value.clone().unwrap_or_default();
            if row.is_valid {
                fact.valid_occurrences.push(value);
            } else {
                fact.invalid_occurrences.push(value);
            }
        }
        record
    }
}
