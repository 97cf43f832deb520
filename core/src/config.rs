use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;

/// Reserved prefix for tagged value envelopes in the flat encoding.
pub const ENVELOPE_PREFIX: &str = "__cpbench_";
/// Envelope tag wrapping an opaque solver-side expression.
pub const EXPR_TAG: &str = "__cpbench_expr";

#[derive(Error, Debug)]
pub enum ValueError {
    #[error("unrecognized value envelope `{0}`")]
    UnknownEnvelope(String),
    #[error("{0} is not representable as a data value")]
    Unrepresentable(String),
}

/// A named solving profile applied to every instance of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    pub name: String,
    pub solver: SolverRef,
    /// Override path for the solving engine's driver executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minizinc: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<i64>,
    #[serde(default)]
    pub free_search: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimisation_level: Option<u32>,
    /// Additional engine flags, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other_flags: BTreeMap<String, DataValue>,
    /// Named values injected into every instance before solving.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_data: BTreeMap<String, DataValue>,
}

impl Configuration {
    pub fn new(name: impl Into<String>, solver: SolverRef) -> Self {
        Self {
            name: name.into(),
            solver,
            minizinc: None,
            processes: None,
            random_seed: None,
            free_search: false,
            optimisation_level: None,
            other_flags: BTreeMap::new(),
            extra_data: BTreeMap::new(),
        }
    }
}

/// Reference to a solving engine backend.
///
/// Solvers resolvable by identity alone travel as a short string (a registry
/// identifier, `id@version`, or a path to a solver definition file); ad hoc
/// solvers carry their full definition inline. The encoding is untagged, so
/// the decoder reconstructs whichever form was used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SolverRef {
    Lookup(String),
    Definition(SolverDef),
}

impl SolverRef {
    pub fn lookup(id: impl Into<String>) -> Self {
        Self::Lookup(id.into())
    }

    /// Identifier and optional pinned version for a `Lookup` reference.
    pub fn identifier(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Self::Lookup(id) => match id.split_once('@') {
                Some((name, version)) => Some((name, Some(version))),
                None => Some((id.as_str(), None)),
            },
            Self::Definition(_) => None,
        }
    }
}

/// Inline definition for a solver not resolvable by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverDef {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mzn_lib: Option<String>,
    /// Remaining definition fields, preserved as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A value in one of the configuration's open-ended maps.
///
/// Closed variant set: primitive scalars, lists, maps and `Expr`, an opaque
/// engine-side expression. Only the codec boundary flattens `Expr` (to a
/// single-key `__cpbench_expr` envelope) and reconstructs it; a single-key
/// map under the reserved prefix with any other tag fails to decode.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<DataValue>),
    Map(BTreeMap<String, DataValue>),
    Expr(String),
}

impl DataValue {
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValueError> {
        match value {
            serde_json::Value::Null => {
                Err(ValueError::Unrepresentable("null".to_string()))
            }
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(ValueError::Unrepresentable(n.to_string()))
                }
            }
            serde_json::Value::String(s) => Ok(Self::Str(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            serde_json::Value::Object(fields) => {
                if fields.len() == 1 {
                    let (tag, inner) = fields.iter().next().expect("len checked");
                    if tag == EXPR_TAG {
                        return match inner.as_str() {
                            Some(expr) => Ok(Self::Expr(expr.to_string())),
                            None => Err(ValueError::UnknownEnvelope(tag.clone())),
                        };
                    }
                    if tag.starts_with(ENVELOPE_PREFIX) {
                        return Err(ValueError::UnknownEnvelope(tag.clone()));
                    }
                }
                fields
                    .into_iter()
                    .map(|(k, v)| Self::from_json(v).map(|v| (k, v)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(Self::Map)
            }
        }
    }

    /// Render as a data-file literal. `Expr` values pass through verbatim,
    /// which is the whole point of carrying them opaquely.
    pub fn to_dzn(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Self::List(items) => {
                let mut out = String::from("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&item.to_dzn());
                }
                out.push(']');
                out
            }
            Self::Map(fields) => {
                let mut out = String::from("(");
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{}: {}", key, value.to_dzn());
                }
                out.push(')');
                out
            }
            Self::Expr(expr) => expr.clone(),
        }
    }

    /// Render as a single command-line argument value.
    pub fn to_flag_arg(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_dzn(),
        }
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(items) => items.serialize(serializer),
            Self::Map(fields) => fields.serialize(serializer),
            Self::Expr(expr) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(EXPR_TAG, expr)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(D::Error::custom)
    }
}
