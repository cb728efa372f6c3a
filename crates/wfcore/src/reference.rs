//! Step output references and the templates built from them.
//!
//! Steps point at each other's results with strings of the form
//! `$(stepRef.outputs)` or `$(stepRef.outputs.field.path)`. The strings stay
//! in the step definitions for wire compatibility; a [`Template`] parses
//! them once so interpolation never touches the raw text again.

use crate::{Value, ValueMap};
use std::collections::HashMap;
use std::fmt;

const OPEN: &str = "$(";
const CLOSE: &str = ")";
const OUTPUTS: &str = "outputs";

/// Parsed `$(stepRef.outputs[.path])` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub step_ref: String,
    pub path: Vec<String>,
}

impl OutputRef {
    pub fn new(step_ref: impl Into<String>) -> Self {
        Self {
            step_ref: step_ref.into(),
            path: Vec::new(),
        }
    }

    /// Project a field of the referenced outputs
    pub fn field(&self, name: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(name.into());
        Self {
            step_ref: self.step_ref.clone(),
            path,
        }
    }

    /// Whether `raw` is written in reference syntax, well-formed or not
    pub fn looks_like_reference(raw: &str) -> bool {
        raw.starts_with(OPEN)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
        let mut segments = body.split('.');

        let step_ref = segments.next().filter(|s| !s.is_empty())?;
        if segments.next()? != OUTPUTS {
            return None;
        }

        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(|s| s.is_empty()) {
            return None;
        }

        Some(Self {
            step_ref: step_ref.to_string(),
            path,
        })
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}.{}", OPEN, self.step_ref, OUTPUTS)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        f.write_str(CLOSE)
    }
}

impl From<OutputRef> for Value {
    fn from(reference: OutputRef) -> Self {
        Value::String(reference.to_string())
    }
}

/// Value tree with references parsed out
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Literal(Value),
    Reference(OutputRef),
    List(Vec<Template>),
    Map(HashMap<String, Template>),
}

impl Template {
    /// Parse every reference string in `value`. Subtrees without references stay literal.
    pub fn compile(value: &Value) -> Template {
        match value {
            Value::String(s) => match OutputRef::parse(s) {
                Some(reference) => Template::Reference(reference),
                None => Template::Literal(value.clone()),
            },
            Value::Array(items) => {
                let items: Vec<Template> = items.iter().map(Template::compile).collect();
                if items.iter().all(Template::is_literal) {
                    Template::Literal(value.clone())
                } else {
                    Template::List(items)
                }
            }
            Value::Object(map) => Template::compile_map(map),
            _ => Template::Literal(value.clone()),
        }
    }

    pub fn compile_map(map: &ValueMap) -> Template {
        let entries: HashMap<String, Template> = map
            .iter()
            .map(|(k, v)| (k.clone(), Template::compile(v)))
            .collect();
        if entries.values().all(Template::is_literal) {
            Template::Literal(Value::Object(map.clone()))
        } else {
            Template::Map(entries)
        }
    }

    fn is_literal(&self) -> bool {
        matches!(self, Template::Literal(_))
    }

    /// Every reference in the tree, depth first
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a OutputRef>) {
        match self {
            Template::Literal(_) => {}
            Template::Reference(r) => found.push(r),
            Template::List(items) => items.iter().for_each(|t| t.collect_references(found)),
            Template::Map(entries) => entries.values().for_each(|t| t.collect_references(found)),
        }
    }

    /// Substitute each reference with whatever `resolve` returns for it
    pub fn render<E, F>(&self, resolve: &F) -> Result<Value, E>
    where
        F: Fn(&OutputRef) -> Result<Value, E>,
    {
        match self {
            Template::Literal(v) => Ok(v.clone()),
            Template::Reference(r) => resolve(r),
            Template::List(items) => items
                .iter()
                .map(|t| t.render(resolve))
                .collect::<Result<Vec<_>, E>>()
                .map(Value::Array),
            Template::Map(entries) => entries
                .iter()
                .map(|(k, t)| t.render(resolve).map(|v| (k.clone(), v)))
                .collect::<Result<ValueMap, E>>()
                .map(Value::Object),
        }
    }
}

/// Every string in `value` that uses reference syntax but does not parse
pub fn malformed_references(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_malformed(value, &mut found);
    found
}

fn collect_malformed(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) if OutputRef::looks_like_reference(s) && OutputRef::parse(s).is_none() => {
            found.push(s.clone())
        }
        Value::Array(items) => items.iter().for_each(|v| collect_malformed(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_malformed(v, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    #[test]
    fn parses_whole_and_projected_references() {
        assert_eq!(OutputRef::parse("$(trigger.outputs)"), Some(OutputRef::new("trigger")));
        assert_eq!(
            OutputRef::parse("$(trigger.outputs.cool.0)"),
            Some(OutputRef::new("trigger").field("cool").field("0"))
        );
        assert_eq!(OutputRef::parse("$(trigger.inputs.cool)"), None);
        assert_eq!(OutputRef::parse("$(.outputs)"), None);
        assert_eq!(OutputRef::parse("$(trigger.outputs..x)"), None);
        assert_eq!(OutputRef::parse("trigger.outputs"), None);
    }

    #[test]
    fn display_matches_wire_form() {
        let reference = OutputRef::new("action").field("price");
        assert_eq!(reference.to_string(), "$(action.outputs.price)");
        assert_eq!(OutputRef::parse(&reference.to_string()), Some(reference));
    }

    #[test]
    fn compile_keeps_reference_free_subtrees_literal() {
        let literal = Value::from(value_map! { "a" => 1, "b" => "plain" });
        assert_eq!(Template::compile(&literal), Template::Literal(literal.clone()));

        let nested = Value::from(value_map! {
            "a" => 1,
            "feeds" => vec![Value::from("$(trigger.outputs.x)"), Value::from(2)],
        });
        let template = Template::compile(&nested);
        let refs = template.references();
        assert_eq!(refs, vec![&OutputRef::new("trigger").field("x")]);
    }

    #[test]
    fn render_substitutes_nested_references() {
        let value = Value::from(value_map! {
            "in" => "$(trigger.outputs.cool)",
            "list" => vec![Value::from("$(trigger.outputs.n)")],
        });
        let template = Template::compile(&value);
        let rendered: Result<Value, String> = template.render(&|r: &OutputRef| {
            match r.path.first().map(String::as_str) {
                Some("cool") => Ok(Value::from("cool")),
                Some("n") => Ok(Value::from(7)),
                _ => Err(r.to_string()),
            }
        });

        let expected = Value::from(value_map! {
            "in" => "cool",
            "list" => vec![Value::from(7)],
        });
        assert_eq!(rendered.unwrap(), expected);
    }

    #[test]
    fn finds_malformed_reference_strings() {
        let value = Value::from(value_map! {
            "good" => "$(trigger.outputs)",
            "bad" => "$(trigger.outptus",
        });
        assert_eq!(malformed_references(&value), vec!["$(trigger.outptus".to_string()]);
    }
}
