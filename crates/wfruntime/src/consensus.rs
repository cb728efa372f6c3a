//! Folding per-participant observations into one DON-wide value.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use wfcore::{ExecutionError, Value, ValueMap};

/// What one participant reported
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Value(Value),
    /// The participant's computation failed; the message is kept for diagnostics
    Error(String),
}

impl Observation {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Observation::Value(v) => Some(v),
            Observation::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Observation::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Observations must agree exactly
    Identical,
    /// Sortable observations; the median is taken
    Median,
    /// Object observations; each top-level field is medianed on its own
    MedianOfFields,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Identical => "identical",
            Aggregation::Median => "median",
            Aggregation::MedianOfFields => "median_of_fields",
        }
    }
}

/// Rule folding observations into one value, with an optional fallback
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusPolicy {
    aggregation: Aggregation,
    default: Option<Value>,
}

impl ConsensusPolicy {
    pub fn identical() -> Self {
        Self::new(Aggregation::Identical)
    }

    pub fn median() -> Self {
        Self::new(Aggregation::Median)
    }

    pub fn median_of_fields() -> Self {
        Self::new(Aggregation::MedianOfFields)
    }

    fn new(aggregation: Aggregation) -> Self {
        Self {
            aggregation,
            default: None,
        }
    }

    /// Return `default` instead of failing when no consensus is reached
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Observations needed for agreement: a strict majority of participants
    pub fn quorum(participants: usize) -> usize {
        participants / 2 + 1
    }

    pub fn fold(&self, observations: &[Observation]) -> Result<Value, ExecutionError> {
        let quorum = Self::quorum(observations.len());
        let values: Vec<&Value> = observations.iter().filter_map(Observation::value).collect();

        let folded = match self.aggregation {
            Aggregation::Identical => identical(&values, quorum),
            Aggregation::Median => median(&values, quorum),
            Aggregation::MedianOfFields => median_of_fields(&values, quorum),
        };

        match (folded, &self.default) {
            (Ok(value), _) => Ok(value),
            (Err(reason), Some(default)) => {
                tracing::debug!(
                    "No {} consensus ({}), using default",
                    self.aggregation.as_str(),
                    reason
                );
                Ok(default.clone())
            }
            (Err(reason), None) => Err(ExecutionError::NoConsensus {
                policy: self.aggregation.as_str(),
                reason,
            }),
        }
    }
}

fn identical(values: &[&Value], quorum: usize) -> Result<Value, String> {
    // (value, count) in first-seen order, so ties go to the earliest observation
    let mut tally: Vec<(&Value, usize)> = Vec::new();
    for value in values {
        match tally.iter_mut().find(|(seen, _)| same_observation(seen, value)) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }

    let best = tally
        .iter()
        .fold(None::<&(&Value, usize)>, |best, entry| match best {
            Some(b) if b.1 >= entry.1 => Some(b),
            _ => Some(entry),
        });

    match best {
        Some((value, count)) if *count >= quorum => Ok((*value).clone()),
        Some((_, count)) => Err(format!(
            "most common observation seen {} time(s), quorum is {}",
            count, quorum
        )),
        None => Err("no successful observations".to_string()),
    }
}

/// Bit equality: `NaN` matches itself, `0.0` and `-0.0` differ
fn same_observation(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.to_bits() == y.to_bits(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_observation(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| same_observation(x, y)))
        }
        _ => a == b,
    }
}

fn median(values: &[&Value], quorum: usize) -> Result<Value, String> {
    if values.len() < quorum {
        return Err(format!(
            "{} successful observation(s), quorum is {}",
            values.len(),
            quorum
        ));
    }

    let mut sorted: Vec<&Value> = values.to_vec();
    if let Some(bad) = sorted.iter().find(|v| !v.is_sortable()) {
        return Err(format!("cannot take the median of a {} observation", bad.kind()));
    }
    let first_kind = sorted[0].kind();
    if sorted.iter().any(|v| v.kind() != first_kind) {
        return Err("observations mix numbers and strings".to_string());
    }

    sorted.sort_by(|a, b| a.sort_cmp(b).unwrap_or(Ordering::Equal));
    Ok(sorted[(sorted.len() - 1) / 2].clone())
}

fn median_of_fields(values: &[&Value], quorum: usize) -> Result<Value, String> {
    let mut objects: Vec<&ValueMap> = Vec::with_capacity(values.len());
    for value in values {
        match value.as_object() {
            Some(map) => objects.push(map),
            None => return Err(format!("expected object observations, got {}", value.kind())),
        }
    }
    if objects.len() < quorum {
        return Err(format!(
            "{} successful observation(s), quorum is {}",
            objects.len(),
            quorum
        ));
    }

    let fields: BTreeSet<&String> = objects.iter().flat_map(|m| m.keys()).collect();
    let mut folded = ValueMap::new();
    for field in fields {
        let column: Vec<&Value> = objects.iter().filter_map(|m| m.get(field)).collect();
        let value = median(&column, quorum).map_err(|reason| format!("field '{}': {}", field, reason))?;
        folded.insert(field.clone(), value);
    }
    Ok(Value::Object(folded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfcore::value_map;

    fn values(raw: &[Value]) -> Vec<Observation> {
        raw.iter().cloned().map(Observation::Value).collect()
    }

    #[test]
    fn identical_returns_majority_value() {
        let observations = vec![
            Observation::Value(Value::from("v")),
            Observation::Value(Value::from("v")),
            Observation::Value(Value::from("w")),
            Observation::Value(Value::from("v")),
        ];
        assert_eq!(ConsensusPolicy::identical().fold(&observations), Ok(Value::from("v")));
    }

    #[test]
    fn identical_compares_numbers_bitwise() {
        let nans = values(&[Value::Number(f64::NAN), Value::Number(f64::NAN), Value::from(1)]);
        assert!(matches!(
            ConsensusPolicy::identical().fold(&nans),
            Ok(Value::Number(n)) if n.is_nan()
        ));

        let zeros = values(&[Value::Number(0.0), Value::Number(-0.0)]);
        assert!(ConsensusPolicy::identical().fold(&zeros).is_err());

        let nested = values(&[
            Value::Array(vec![Value::Number(f64::NAN)]),
            Value::Array(vec![Value::Number(f64::NAN)]),
        ]);
        assert!(ConsensusPolicy::identical().fold(&nested).is_ok());
    }

    #[test]
    fn identical_without_quorum_fails_or_defaults() {
        let observations = values(&[Value::from(1), Value::from(2), Value::from(3)]);
        let err = ConsensusPolicy::identical().fold(&observations).unwrap_err();
        assert!(matches!(err, ExecutionError::NoConsensus { policy: "identical", .. }));

        let folded = ConsensusPolicy::identical()
            .with_default("fallback")
            .fold(&observations);
        assert_eq!(folded, Ok(Value::from("fallback")));
    }

    #[test]
    fn participant_errors_count_against_quorum() {
        let observations = vec![
            Observation::Value(Value::from(5)),
            Observation::Error("rpc down".into()),
            Observation::Error("rpc down".into()),
            Observation::Value(Value::from(5)),
        ];
        assert!(ConsensusPolicy::identical().fold(&observations).is_err());

        let observations = vec![
            Observation::Value(Value::from(5)),
            Observation::Error("rpc down".into()),
            Observation::Value(Value::from(5)),
        ];
        assert_eq!(ConsensusPolicy::identical().fold(&observations), Ok(Value::from(5)));
    }

    #[test]
    fn median_takes_lower_middle() {
        let observations = values(&[Value::from(9), Value::from(1), Value::from(5), Value::from(3)]);
        assert_eq!(ConsensusPolicy::median().fold(&observations), Ok(Value::from(3)));

        let observations = values(&[Value::from("b"), Value::from("c"), Value::from("a")]);
        assert_eq!(ConsensusPolicy::median().fold(&observations), Ok(Value::from("b")));
    }

    #[test]
    fn median_rejects_mixed_or_unsortable_values() {
        let mixed = values(&[Value::from(1), Value::from("a"), Value::from(2)]);
        assert!(ConsensusPolicy::median().fold(&mixed).is_err());

        let unsortable = values(&[Value::Bool(true), Value::Bool(true), Value::Bool(true)]);
        let folded = ConsensusPolicy::median().with_default(0).fold(&unsortable);
        assert_eq!(folded, Ok(Value::from(0)));
    }

    #[test]
    fn median_of_fields_folds_each_field() {
        let observations = values(&[
            Value::from(value_map! { "price" => 10, "volume" => 300 }),
            Value::from(value_map! { "price" => 12, "volume" => 100 }),
            Value::from(value_map! { "price" => 11, "volume" => 200 }),
        ]);
        let folded = ConsensusPolicy::median_of_fields().fold(&observations);
        assert_eq!(
            folded,
            Ok(Value::from(value_map! { "price" => 11, "volume" => 200 }))
        );
    }

    #[test]
    fn median_of_fields_needs_quorum_per_field() {
        let observations = values(&[
            Value::from(value_map! { "price" => 10, "rare" => 1 }),
            Value::from(value_map! { "price" => 12 }),
            Value::from(value_map! { "price" => 11 }),
        ]);
        assert!(ConsensusPolicy::median_of_fields().fold(&observations).is_err());
    }
}
