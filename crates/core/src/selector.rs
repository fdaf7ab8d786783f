//! Kubernetes style label selectors: a conjunction of requirements over a label set.
//!
//! String form follows the API server grammar: `key`, `!key`, `key=value`, `key==value`,
//! `key!=value`, `key in (a,b)`, `key notin (a,b)`, joined with commas.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;

use crate::{Error, Labels, Result};

static LABEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?)$").expect("static regex"));
static DNS_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex"));
static SET_TERM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+(in|notin)\s*\((.*)\)$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Exists,
    DoesNotExist,
    Equals,
    NotEquals,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    /// Validated constructor: the key must be a qualified label name, values must be label values,
    /// and the value count must fit the operator.
    pub fn new<I, S>(key: &str, operator: Operator, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_key(key)?;
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        for v in values.iter() {
            validate_value(v)?;
        }
        let ok = match operator {
            Operator::Exists | Operator::DoesNotExist => values.is_empty(),
            Operator::Equals | Operator::NotEquals => values.len() == 1,
            Operator::In | Operator::NotIn => !values.is_empty(),
        };
        if !ok {
            return Err(Error::InvalidSelector {
                selector: key.to_string(),
                reason: format!("{} values for operator {:?}", values.len(), operator),
            });
        }
        Ok(Self { key: key.to_string(), operator, values })
    }

    /// Pre-req: `key` is a valid label key.
    pub fn exists(key: &str) -> Self {
        Self { key: key.to_string(), operator: Operator::Exists, values: BTreeSet::new() }
    }

    /// Pre-req: `key` is a valid label key.
    pub fn does_not_exist(key: &str) -> Self {
        Self { key: key.to_string(), operator: Operator::DoesNotExist, values: BTreeSet::new() }
    }

    /// Pre-req: `key` and `value` are valid.
    pub fn equals(key: &str, value: &str) -> Self {
        Self { key: key.to_string(), operator: Operator::Equals, values: BTreeSet::from([value.to_string()]) }
    }

    pub fn key(&self) -> &str { &self.key }
    pub fn operator(&self) -> Operator { self.operator }
    pub fn values(&self) -> &BTreeSet<String> { &self.values }

    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::Equals | Operator::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotEquals | Operator::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
        }
    }
}

/// Conjunction of requirements. The empty selector matches every label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: SmallVec<[Requirement; 4]>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Returns a new selector with the requirement appended; `self` is left untouched.
    pub fn add(&self, requirement: Requirement) -> Self {
        let mut out = self.clone();
        out.requirements.push(requirement);
        out
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut requirements = SmallVec::new();
        for term in split_terms(input) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term).map_err(|reason| Error::InvalidSelector {
                selector: input.to_string(),
                reason,
            })?);
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Requirement> for Selector {
    fn from(r: Requirement) -> Self {
        Self::everything().add(r)
    }
}

// Commas inside `( ... )` belong to a set term.
fn split_terms(input: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&input[start..]);
    out
}

fn parse_term(term: &str) -> std::result::Result<Requirement, String> {
    let err = |e: Error| e.to_string();
    if let Some(caps) = SET_TERM.captures(term) {
        let key = &caps[1];
        let op = if &caps[2] == "in" { Operator::In } else { Operator::NotIn };
        let values: Vec<String> =
            caps[3].split(',').map(str::trim).filter(|v| !v.is_empty()).map(str::to_string).collect();
        return Requirement::new(key, op, values).map_err(err);
    }
    if let Some(key) = term.strip_prefix('!') {
        return Requirement::new(key.trim(), Operator::DoesNotExist, Vec::<String>::new()).map_err(err);
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Requirement::new(key.trim(), Operator::NotEquals, [value.trim()]).map_err(err);
    }
    if let Some((key, value)) = term.split_once("==") {
        return Requirement::new(key.trim(), Operator::Equals, [value.trim()]).map_err(err);
    }
    if let Some((key, value)) = term.split_once('=') {
        return Requirement::new(key.trim(), Operator::Equals, [value.trim()]).map_err(err);
    }
    Requirement::new(term, Operator::Exists, Vec::<String>::new()).map_err(err)
}

fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > 253 || !DNS_SUBDOMAIN.is_match(p) {
            return Err(Error::InvalidLabel(key.to_string()));
        }
    }
    if !LABEL_NAME.is_match(name) {
        return Err(Error::InvalidLabel(key.to_string()));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.is_empty() || LABEL_NAME.is_match(value) {
        Ok(())
    } else {
        Err(Error::InvalidLabel(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = Selector::parse("").unwrap();
        assert!(s.is_empty());
        assert!(s.matches(&labels(&[])));
        assert!(s.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn parses_all_operators() {
        let s = Selector::parse("os-name=ubuntu, os-arch in (amd64,arm64),!run.tanzu.vmware.com/invalid,tier!=db,v1.23,zone notin (x)").unwrap();
        assert_eq!(s.requirements().len(), 6);
        assert_eq!(s.requirements()[1].operator(), Operator::In);
        assert_eq!(s.requirements()[2].operator(), Operator::DoesNotExist);
        assert_eq!(s.requirements()[4].operator(), Operator::Exists);

        assert!(s.matches(&labels(&[("os-name", "ubuntu"), ("os-arch", "arm64"), ("v1.23", "")])));
        assert!(!s.matches(&labels(&[("os-name", "ubuntu"), ("os-arch", "arm64")])), "v1.23 missing");
        assert!(!s.matches(&labels(&[
            ("os-name", "ubuntu"),
            ("os-arch", "amd64"),
            ("v1.23", ""),
            ("run.tanzu.vmware.com/invalid", ""),
        ])));
        assert!(!s.matches(&labels(&[("os-name", "ubuntu"), ("os-arch", "amd64"), ("v1.23", ""), ("zone", "x")])));
    }

    #[test]
    fn not_equals_matches_absent_key() {
        let s = Selector::parse("tier!=db").unwrap();
        assert!(s.matches(&labels(&[])));
        assert!(s.matches(&labels(&[("tier", "web")])));
        assert!(!s.matches(&labels(&[("tier", "db")])));
    }

    #[test]
    fn double_equals_is_equals() {
        let s = Selector::parse("a==b").unwrap();
        assert_eq!(s, Selector::from(Requirement::equals("a", "b")));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let input = "os-name=ubuntu,os-arch in (amd64,arm64),!run.tanzu.vmware.com/deactivated";
        let s = Selector::parse(input).unwrap();
        assert_eq!(s.to_string(), input);
        assert_eq!(Selector::parse(&s.to_string()).unwrap(), s);
    }

    #[test]
    fn rejects_malformed_terms() {
        assert!(Selector::parse("a in ()").is_err());
        assert!(Selector::parse("=b").is_err());
        assert!(Selector::parse("bad key=x").is_err());
        assert!(Selector::parse("UPPER.example/x").is_err());
    }

    #[test]
    fn add_does_not_touch_original() {
        let base = Selector::parse("a").unwrap();
        let more = base.add(Requirement::does_not_exist("b"));
        assert_eq!(base.requirements().len(), 1);
        assert_eq!(more.requirements().len(), 2);
    }
}
