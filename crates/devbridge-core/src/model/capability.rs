// ── Capability model ──
//
// Declared per device: which fields exist, their value type, and whether
// they can be read (appear in state) or written (accepted in commands).
// Each spec compiles once into a `FieldKind`, the tagged variant that
// value checks dispatch on.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use devbridge_broker::payload::Values;

/// Declared value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Enum,
    String,
}

fn default_true() -> bool {
    true
}

/// Declaration of one field, as it appears in configuration and in
/// discovery payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl FieldSpec {
    fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            readable: true,
            writable: false,
            min: None,
            max: None,
            options: Vec::new(),
            unit: None,
        }
    }

    pub fn bool() -> Self {
        Self::of(FieldType::Bool)
    }

    pub fn int() -> Self {
        Self::of(FieldType::Int)
    }

    pub fn float() -> Self {
        Self::of(FieldType::Float)
    }

    pub fn string() -> Self {
        Self::of(FieldType::String)
    }

    pub fn enumeration<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            options: options.into_iter().map(Into::into).collect(),
            ..Self::of(FieldType::Enum)
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Writable but never reported in state.
    pub fn write_only(mut self) -> Self {
        self.writable = true;
        self.readable = false;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn kind(&self) -> FieldKind {
        match self.field_type {
            FieldType::Bool => FieldKind::Bool,
            FieldType::Int => FieldKind::Int {
                min: self.min,
                max: self.max,
            },
            FieldType::Float => FieldKind::Float {
                min: self.min,
                max: self.max,
            },
            FieldType::Enum => FieldKind::Enum {
                options: self.options.clone(),
            },
            FieldType::String => FieldKind::Text,
        }
    }

    /// Problems that make the declaration itself unusable.
    pub fn defect(&self) -> Option<String> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Some(format!("min {min} exceeds max {max}"));
            }
        }
        if self.field_type == FieldType::Enum && self.options.is_empty() {
            return Some("enum field declares no options".into());
        }
        None
    }
}

// ── FieldKind ────────────────────────────────────────────────────────

/// Compiled form of a [`FieldSpec`], used for value checks.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Bool,
    Int { min: Option<f64>, max: Option<f64> },
    Float { min: Option<f64>, max: Option<f64> },
    Enum { options: Vec<String> },
    Text,
}

impl FieldKind {
    /// Check a requested value. Returns the reason it is unacceptable.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::Bool if value.is_boolean() => Ok(()),
            Self::Bool => Err("expected a boolean".into()),
            Self::Int { min, max } if value.is_i64() || value.is_u64() => {
                check_range(value, *min, *max)
            }
            Self::Int { .. } => Err("expected an integer".into()),
            Self::Float { min, max } if value.is_number() => check_range(value, *min, *max),
            Self::Float { .. } => Err("expected a number".into()),
            Self::Enum { options } => match value.as_str() {
                Some(s) if options.iter().any(|o| o == s) => Ok(()),
                Some(s) => Err(format!("{s:?} is not one of {}", options.join(", "))),
                None => Err("expected one of the declared options".into()),
            },
            Self::Text if value.is_string() => Ok(()),
            Self::Text => Err("expected a string".into()),
        }
    }
}

fn check_range(value: &Value, min: Option<f64>, max: Option<f64>) -> Result<(), String> {
    let Some(n) = value.as_f64() else {
        return Err("expected a number".into());
    };
    if let Some(min) = min {
        if n < min {
            return Err(format!("{n} is below minimum {min}"));
        }
    }
    if let Some(max) = max {
        if n > max {
            return Err(format!("{n} is above maximum {max}"));
        }
    }
    Ok(())
}

// ── CapabilityModel ──────────────────────────────────────────────────

/// One rejected field in a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldProblem {
    pub field: String,
    pub reason: String,
}

/// Ordered set of field declarations for one device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(
    from = "IndexMap<String, FieldSpec>",
    into = "IndexMap<String, FieldSpec>"
)]
pub struct CapabilityModel {
    specs: IndexMap<String, FieldSpec>,
    kinds: IndexMap<String, FieldKind>,
}

impl From<IndexMap<String, FieldSpec>> for CapabilityModel {
    fn from(specs: IndexMap<String, FieldSpec>) -> Self {
        let kinds = specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.kind()))
            .collect();
        Self { specs, kinds }
    }
}

impl From<CapabilityModel> for IndexMap<String, FieldSpec> {
    fn from(model: CapabilityModel) -> Self {
        model.specs
    }
}

impl<S: Into<String>> FromIterator<(S, FieldSpec)> for CapabilityModel {
    fn from_iter<T: IntoIterator<Item = (S, FieldSpec)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(name, spec)| (name.into(), spec))
            .collect::<IndexMap<_, _>>()
            .into()
    }
}

impl CapabilityModel {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        self.kinds.insert(name.clone(), spec.kind());
        self.specs.insert(name, spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.specs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.specs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn is_readable(&self, name: &str) -> bool {
        self.specs.get(name).is_some_and(|s| s.readable)
    }

    /// Check every requested field: it must exist, be writable, and hold
    /// an acceptable value. All offending fields are reported, in request
    /// order.
    pub fn validate_command(&self, values: &Values) -> Result<(), Vec<FieldProblem>> {
        let problems: Vec<FieldProblem> = values
            .iter()
            .filter_map(|(field, value)| {
                let reason = match (self.specs.get(field), self.kinds.get(field)) {
                    (Some(spec), Some(kind)) if spec.writable => kind.check(value).err()?,
                    (Some(_), _) => "field is not writable".to_owned(),
                    (None, _) => "unknown field".to_owned(),
                };
                Some(FieldProblem {
                    field: field.clone(),
                    reason,
                })
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// The subset of `values` that this model declares readable.
    pub fn retain_readable(&self, values: &Values) -> Values {
        values
            .iter()
            .filter(|(field, _)| self.is_readable(field))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn lamp() -> CapabilityModel {
        CapabilityModel::new()
            .with_field("power", FieldSpec::bool().writable())
            .with_field("brightness", FieldSpec::int().writable().range(0.0, 100.0))
            .with_field("mode", FieldSpec::enumeration(["eco", "boost"]).writable())
            .with_field("temperature", FieldSpec::float().unit("°C"))
    }

    fn values(v: Value) -> Values {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn accepts_valid_command() {
        assert!(
            lamp()
                .validate_command(&values(json!({"power": true, "brightness": 40, "mode": "eco"})))
                .is_ok()
        );
    }

    #[test]
    fn lists_every_offending_field() {
        let problems = lamp()
            .validate_command(&values(json!({
                "power": "on",
                "volume": 3,
                "temperature": 21.5,
                "brightness": 140,
                "mode": "turbo"
            })))
            .unwrap_err();

        let fields: Vec<&str> = problems.iter().map(|p| p.field.as_str()).collect();
        assert_eq!(fields, ["power", "volume", "temperature", "brightness", "mode"]);
        assert_eq!(problems[1].reason, "unknown field");
        assert_eq!(problems[2].reason, "field is not writable");
    }

    #[test]
    fn int_rejects_fractions_float_accepts_ints() {
        assert!(FieldKind::Int { min: None, max: None }.check(&json!(1.5)).is_err());
        assert!(FieldKind::Float { min: None, max: None }.check(&json!(2)).is_ok());
    }

    #[test]
    fn retain_readable_drops_undeclared_and_write_only() {
        let model = lamp().with_field("reset", FieldSpec::bool().write_only());
        let kept = model.retain_readable(&values(json!({
            "power": true,
            "reset": true,
            "rssi": -60
        })));
        assert_eq!(kept, values(json!({"power": true})));
    }

    #[test]
    fn deserializes_from_field_table() {
        let model: CapabilityModel = serde_json::from_value(json!({
            "power": {"type": "bool", "writable": true},
            "humidity": {"type": "float", "unit": "%"}
        }))
        .unwrap();

        assert!(model.get("power").unwrap().writable);
        assert!(model.get("humidity").unwrap().readable);
        assert!(!model.get("humidity").unwrap().writable);
        assert!(
            model
                .validate_command(&values(json!({"power": false})))
                .is_ok()
        );
        assert_eq!(
            serde_json::to_value(&model).unwrap()["humidity"],
            json!({"type": "float", "readable": true, "writable": false, "unit": "%"})
        );
    }

    #[test]
    fn detects_declaration_defects() {
        assert!(FieldSpec::int().range(5.0, 1.0).defect().is_some());
        assert!(FieldSpec::enumeration(Vec::<String>::new()).defect().is_some());
        assert!(FieldSpec::bool().defect().is_none());
    }
}
