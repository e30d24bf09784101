//! Filter expressions for statistics queries.
//!
//! Each filter is `field@@value` or `field:value`, optionally with the value in
//! double quotes (`%22` is accepted for a URL-encoded quote). The field ends at
//! the first `@@`, or at the first `:` when there is none; everything after it
//! is the value, separators included. Filters are ANDed.
//! Parsing is strict: an unknown field or an unparsable value is rejected
//! before any file is opened.

use crate::record::RecordFacts;
use crate::schema::{
    COL_INSTITUTION, COL_IS_TRANSFORMED, COL_NETWORK, COL_RECORD_IS_VALID, COL_REPOSITORY,
    COL_RULE_ID,
};
use crate::statistics::{ColumnPredicate, StatValue};
use crate::types::FactPartition;
use harvest_result::{Error, Result};
use harvest_types::layout::sanitize_network_acronym;
use harvest_types::RuleId;

/// How the `identifier` filter compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierMatch {
    Exact(String),
    /// `identifier:*fragment*`
    Contains(String),
}

impl IdentifierMatch {
    fn matches(&self, identifier: &str) -> bool {
        match self {
            Self::Exact(v) => identifier == v,
            Self::Contains(v) => identifier.contains(v.as_str()),
        }
    }
}

/// Parsed, validated filter list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub record_is_valid: Option<bool>,
    pub is_transformed: Option<bool>,
    pub identifier: Option<IdentifierMatch>,
    pub institution: Option<String>,
    pub repository: Option<String>,
    pub network: Option<String>,
    pub valid_rules: Vec<RuleId>,
    pub invalid_rules: Vec<RuleId>,
    pub any_rules: Vec<RuleId>,
}

impl FilterSet {
    /// Parse a list of filter expressions.
    pub fn parse<S: AsRef<str>>(filters: &[S]) -> Result<Self> {
        let mut set = Self::default();
        for filter in filters {
            set.apply(filter.as_ref())?;
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&mut self, raw: &str) -> Result<()> {
        let (field, value) = raw
            .split_once("@@")
            .or_else(|| raw.split_once(':'))
            .ok_or_else(|| Error::invalid_filter(raw, "expected field:value"))?;
        let field = field.trim();
        let value = value.trim().replace("%22", "\"");
        let value = strip_quotes(&value);

        match field {
            "isValid" | "record_is_valid" => self.record_is_valid = Some(parse_bool(raw, value)?),
            "isTransformed" | "record_is_transformed" | "is_transformed" => {
                self.is_transformed = Some(parse_bool(raw, value)?)
            }
            "valid_rules" => self.valid_rules.push(parse_rule(raw, value)?),
            "invalid_rules" => self.invalid_rules.push(parse_rule(raw, value)?),
            "rule_id" | "ruleId" => self.any_rules.push(parse_rule(raw, value)?),
            "identifier" => self.identifier = Some(parse_identifier(raw, value)?),
            "institution_name" | "institutionName" => {
                self.institution = Some(non_empty(raw, value)?.to_string())
            }
            "repository_name" | "repositoryName" => {
                self.repository = Some(non_empty(raw, value)?.to_string())
            }
            "network" => self.network = Some(sanitize_network_acronym(non_empty(raw, value)?)),
            "" => return Err(Error::invalid_filter(raw, "missing field name")),
            other => return Err(Error::invalid_filter(raw, format!("unknown field '{other}'"))),
        }
        Ok(())
    }

    /// Partition the filter restricts the scan to, if any.
    pub fn partition(&self) -> Option<FactPartition> {
        self.record_is_valid.map(FactPartition::of)
    }

    /// Column-level equality predicates for row-group pruning.
    ///
    /// Rule predicates are sound only because a record's rows never span row
    /// groups.
    pub fn predicates(&self) -> Vec<ColumnPredicate> {
        let mut out = Vec::new();
        if let Some(v) = self.record_is_valid {
            out.push(ColumnPredicate::eq(COL_RECORD_IS_VALID, StatValue::Bool(v)));
        }
        if let Some(v) = self.is_transformed {
            out.push(ColumnPredicate::eq(COL_IS_TRANSFORMED, StatValue::Bool(v)));
        }
        if let Some(v) = &self.institution {
            out.push(ColumnPredicate::eq(COL_INSTITUTION, StatValue::Utf8(v.clone())));
        }
        if let Some(v) = &self.repository {
            out.push(ColumnPredicate::eq(COL_REPOSITORY, StatValue::Utf8(v.clone())));
        }
        if let Some(v) = &self.network {
            out.push(ColumnPredicate::eq(COL_NETWORK, StatValue::Utf8(v.clone())));
        }
        for rule in self
            .valid_rules
            .iter()
            .chain(&self.invalid_rules)
            .chain(&self.any_rules)
        {
            out.push(ColumnPredicate::eq(COL_RULE_ID, StatValue::Int32(*rule)));
        }
        out
    }

    /// Row-by-row evaluation on a complete record.
    pub fn matches(&self, record: &RecordFacts) -> bool {
        self.record_is_valid.map_or(true, |v| record.record_is_valid == v)
            && self.is_transformed.map_or(true, |v| record.is_transformed == v)
            && self
                .identifier
                .as_ref()
                .map_or(true, |m| m.matches(&record.identifier))
            && self
                .institution
                .as_ref()
                .map_or(true, |v| record.institution.as_deref() == Some(v.as_str()))
            && self
                .repository
                .as_ref()
                .map_or(true, |v| record.repository.as_deref() == Some(v.as_str()))
            && self.network.as_ref().map_or(true, |v| &record.network == v)
            && self.valid_rules.iter().all(|r| record.has_rule(*r, Some(true)))
            && self.invalid_rules.iter().all(|r| record.has_rule(*r, Some(false)))
            && self.any_rules.iter().all(|r| record.has_rule(*r, None))
    }
}

fn strip_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn non_empty<'a>(raw: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() {
        Err(Error::invalid_filter(raw, "empty value"))
    } else {
        Ok(value)
    }
}

fn parse_bool(raw: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(Error::invalid_filter(raw, "expected true or false"))
    }
}

fn parse_rule(raw: &str, value: &str) -> Result<RuleId> {
    value
        .parse()
        .map_err(|_| Error::invalid_filter(raw, "expected a numeric rule id"))
}

fn parse_identifier(raw: &str, value: &str) -> Result<IdentifierMatch> {
    let value = non_empty(raw, value)?;
    match value.strip_prefix('*').and_then(|v| v.strip_suffix('*')) {
        Some("") => Err(Error::invalid_filter(raw, "empty identifier pattern")),
        Some(fragment) => Ok(IdentifierMatch::Contains(fragment.to_string())),
        None => Ok(IdentifierMatch::Exact(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_separators() {
        let set = FilterSet::parse(&[
            "record_is_valid:false",
            "institution_name@@\"Universidad de Chile\"",
            "valid_rules@@%2212%22",
        ])
        .unwrap();
        assert_eq!(set.record_is_valid, Some(false));
        assert_eq!(set.institution.as_deref(), Some("Universidad de Chile"));
        assert_eq!(set.valid_rules, vec![12]);
        assert_eq!(set.partition(), Some(FactPartition::Invalid));
    }

    #[test]
    fn test_separators_inside_values_are_kept() {
        let set = FilterSet::parse(&[
            "identifier@@oai:repo:1",
            "institution_name@@A@@B",
            "repository_name:%22Repo: Teses%22",
        ])
        .unwrap();
        assert_eq!(
            set.identifier,
            Some(IdentifierMatch::Exact("oai:repo:1".to_string()))
        );
        assert_eq!(set.institution.as_deref(), Some("A@@B"));
        assert_eq!(set.repository.as_deref(), Some("Repo: Teses"));

        let err = FilterSet::parse(&["%22isValid%22:true"]).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter { .. }));
    }

    #[test]
    fn test_aliases() {
        let a = FilterSet::parse(&["isValid:TRUE", "repositoryName:Repo"]).unwrap();
        let b = FilterSet::parse(&["record_is_valid:true", "repository_name:Repo"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identifier_modes() {
        let exact = FilterSet::parse(&["identifier:oai:x:1"]).unwrap();
        assert_eq!(
            exact.identifier,
            Some(IdentifierMatch::Exact("oai:x:1".to_string()))
        );
        let contains = FilterSet::parse(&["identifier:*x:1*"]).unwrap();
        assert_eq!(
            contains.identifier,
            Some(IdentifierMatch::Contains("x:1".to_string()))
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["novalue", "isValid:maybe", "valid_rules:abc", "colour:red", ":x", "identifier:**"] {
            let err = FilterSet::parse(&[bad]).unwrap_err();
            assert!(matches!(err, Error::InvalidFilter { .. }), "{bad}");
        }
    }

    #[test]
    fn test_predicates() {
        let set = FilterSet::parse(&["isTransformed:true", "invalid_rules:4"]).unwrap();
        let preds = set.predicates();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[1], ColumnPredicate::eq(COL_RULE_ID, StatValue::Int32(4)));
        assert!(FilterSet::parse::<&str>(&[]).unwrap().is_empty());
    }
}
