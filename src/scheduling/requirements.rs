//! Node selector requirements modelled as value sets.
//!
//! A requirement is either a finite set of allowed values or the complement
//! of a finite set of disallowed values, optionally bounded by integer
//! `Gt`/`Lt` limits. This makes intersection closed over every operator.

use crate::crd::NodeSelectorRequirementWithMinValues;
use crate::error::{OperatorError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl FromStr for Operator {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "In" => Ok(Operator::In),
            "NotIn" => Ok(Operator::NotIn),
            "Exists" => Ok(Operator::Exists),
            "DoesNotExist" => Ok(Operator::DoesNotExist),
            "Gt" => Ok(Operator::Gt),
            "Lt" => Ok(Operator::Lt),
            other => Err(OperatorError::InvalidState(format!(
                "unsupported node selector operator {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::In => "In",
            Operator::NotIn => "NotIn",
            Operator::Exists => "Exists",
            Operator::DoesNotExist => "DoesNotExist",
            Operator::Gt => "Gt",
            Operator::Lt => "Lt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    pub min_values: Option<i32>,
}

impl Requirement {
    pub fn new<I, S>(key: &str, operator: Operator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let mut requirement = Requirement {
            key: key.to_string(),
            complement: false,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            min_values: None,
        };
        match operator {
            Operator::In => requirement.values.extend(values),
            Operator::NotIn => {
                requirement.complement = true;
                requirement.values.extend(values);
            }
            Operator::Exists => requirement.complement = true,
            Operator::DoesNotExist => {}
            Operator::Gt => {
                requirement.complement = true;
                requirement.greater_than = values.first().and_then(|v| v.parse().ok());
            }
            Operator::Lt => {
                requirement.complement = true;
                requirement.less_than = values.first().and_then(|v| v.parse().ok());
            }
        }
        requirement
    }

    /// Normalised operator; bounded requirements report Exists or NotIn.
    pub fn operator(&self) -> Operator {
        match (self.complement, self.values.is_empty()) {
            (true, false) => Operator::NotIn,
            (true, true) => Operator::Exists,
            (false, false) => Operator::In,
            (false, true) => Operator::DoesNotExist,
        }
    }

    /// Number of admitted values. A complement bounded on both sides admits
    /// the integers strictly inside its window; otherwise it is effectively
    /// unbounded.
    pub fn len(&self) -> usize {
        if !self.complement {
            return self.values.len();
        }
        match (self.greater_than, self.less_than) {
            (Some(gt), Some(lt)) => {
                let window = (i128::from(lt) - i128::from(gt) - 1).max(0);
                let excluded: BTreeSet<i64> = self
                    .values
                    .iter()
                    .filter_map(|v| v.parse::<i64>().ok())
                    .filter(|v| *v > gt && *v < lt)
                    .collect();
                usize::try_from(window - excluded.len() as i128).unwrap_or(usize::MAX)
            }
            _ => usize::MAX - self.values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, value: &str) -> bool {
        let listed = self.values.contains(value);
        let admitted = if self.complement { !listed } else { listed };
        admitted && self.within_bounds(value)
    }

    pub fn values(&self) -> impl Iterator<Item = &String> {
        self.values.iter()
    }

    /// The single admitted value of an `In` requirement with one value
    pub fn single_value(&self) -> Option<&str> {
        if self.operator() == Operator::In && self.values.len() == 1 {
            self.values.iter().next().map(String::as_str)
        } else {
            None
        }
    }

    pub fn intersection(&self, other: &Requirement) -> Requirement {
        let complement = self.complement && other.complement;
        let greater_than = max_option(self.greater_than, other.greater_than);
        let less_than = min_option(self.less_than, other.less_than);
        let min_values = max_option(self.min_values, other.min_values);

        if let (Some(gt), Some(lt)) = (greater_than, less_than) {
            if gt >= lt {
                let mut empty = Requirement::new(&self.key, Operator::DoesNotExist, Vec::<String>::new());
                empty.min_values = min_values;
                return empty;
            }
        }

        let values: BTreeSet<String> = match (self.complement, other.complement) {
            (true, true) => self.values.union(&other.values).cloned().collect(),
            (true, false) => other.values.difference(&self.values).cloned().collect(),
            (false, true) => self.values.difference(&other.values).cloned().collect(),
            (false, false) => self.values.intersection(&other.values).cloned().collect(),
        };
        let values = values
            .into_iter()
            .filter(|v| within(v, greater_than, less_than))
            .collect();

        let (greater_than, less_than) = if complement {
            (greater_than, less_than)
        } else {
            (None, None)
        };
        Requirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            min_values,
        }
    }

    fn within_bounds(&self, value: &str) -> bool {
        within(value, self.greater_than, self.less_than)
    }
}

fn within(value: &str, greater_than: Option<i64>, less_than: Option<i64>) -> bool {
    if greater_than.is_none() && less_than.is_none() {
        return true;
    }
    let Ok(v) = value.parse::<i64>() else {
        return false;
    };
    greater_than.map_or(true, |gt| v > gt) && less_than.map_or(true, |lt| v < lt)
}

/// `Gt` and `Lt` take exactly one integer value
fn integer_bound(r: &NodeSelectorRequirementWithMinValues) -> Result<i64> {
    match r.values.as_slice() {
        [value] => value.parse().map_err(|_| {
            OperatorError::InvalidState(format!(
                "node selector {} {} requires an integer value, got {:?}",
                r.key, r.operator, value
            ))
        }),
        values => Err(OperatorError::InvalidState(format!(
            "node selector {} {} requires a single value, got {}",
            r.key,
            r.operator,
            values.len()
        ))),
    }
}

fn max_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Requirements keyed by label; adding a key twice intersects the two.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    by_key: BTreeMap<String, Requirement>,
}

impl Requirements {
    pub fn new(requirements: impl IntoIterator<Item = Requirement>) -> Self {
        let mut out = Requirements::default();
        for r in requirements {
            out.add(r);
        }
        out
    }

    pub fn from_node_selector(requirements: &[NodeSelectorRequirementWithMinValues]) -> Result<Self> {
        let mut out = Requirements::default();
        for r in requirements {
            let operator: Operator = r.operator.parse()?;
            if matches!(operator, Operator::Gt | Operator::Lt) {
                integer_bound(r)?;
            }
            let mut requirement = Requirement::new(&r.key, operator, r.values.iter().cloned());
            requirement.min_values = r.min_values;
            out.add(requirement);
        }
        Ok(out)
    }

    pub fn add(&mut self, requirement: Requirement) {
        let merged = match self.by_key.get(&requirement.key) {
            Some(existing) => existing.intersection(&requirement),
            None => requirement,
        };
        self.by_key.insert(merged.key.clone(), merged);
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.by_key.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.by_key.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.by_key.values()
    }

    /// Checks that `incoming` can be satisfied alongside `self`.
    ///
    /// Keys of `incoming` that `self` does not mention must be allowed
    /// undefined, or be negative (`NotIn`/`DoesNotExist`). Keys both sides
    /// mention must intersect.
    pub fn compatible(
        &self,
        incoming: &Requirements,
        allow_undefined: &BTreeSet<String>,
    ) -> std::result::Result<(), String> {
        for (key, requirement) in &incoming.by_key {
            if allow_undefined.contains(key) || self.has(key) {
                continue;
            }
            if matches!(requirement.operator(), Operator::NotIn | Operator::DoesNotExist) {
                continue;
            }
            return Err(format!("label {:?} does not have known values", key));
        }
        self.intersects(incoming)
    }

    /// Every shared key must admit at least one common value, unless both
    /// sides are negative.
    pub fn intersects(&self, incoming: &Requirements) -> std::result::Result<(), String> {
        for (key, existing) in &self.by_key {
            let Some(other) = incoming.get(key) else {
                continue;
            };
            if !existing.intersection(other).is_empty() {
                continue;
            }
            let negative = |op: Operator| matches!(op, Operator::NotIn | Operator::DoesNotExist);
            if negative(other.operator()) && negative(existing.operator()) {
                continue;
            }
            return Err(format!(
                "key {}, {} {:?} not in {} {:?}",
                key,
                existing.operator(),
                existing.values.iter().collect::<Vec<_>>(),
                other.operator(),
                other.values.iter().collect::<Vec<_>>()
            ));
        }
        Ok(())
    }

    /// Labels for every requirement that admits exactly one value
    pub fn single_valued_labels(&self) -> BTreeMap<String, String> {
        self.by_key
            .iter()
            .filter_map(|(k, r)| r.single_value().map(|v| (k.clone(), v.to_string())))
            .collect()
    }
}
