//! Input schema validation (§4.D): defaults applied, loose type coercion, unknown keys
//! dropped unless the schema flags `passthrough`, and a full error list (not fail-fast) for
//! missing-required/out-of-range fields.

use serde_json::Value;

use noema_model::{FieldSpec, FieldType, InputSchema, ResolvedInputs};

#[derive(Clone, Debug, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

fn coerce(value: &Value, field_type: FieldType) -> Option<Value> {
    match (field_type, value) {
        (FieldType::String, Value::String(_)) => Some(value.clone()),
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::Number, Value::Number(_)) => Some(value.clone()),
        (FieldType::Number, Value::String(s)) => s.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number),
        (FieldType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (FieldType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Enum, Value::String(_)) => Some(value.clone()),
        _ => None,
    }
}

fn in_range(spec: &FieldSpec, value: &Value) -> bool {
    let Some(n) = value.as_f64() else {
        return true;
    };
    spec.min.map_or(true, |min| n >= min) && spec.max.map_or(true, |max| n <= max)
}

/// Validates `raw` against `schema`. Always returns every violation found, not just the
/// first, so a caller can surface a complete `INVALID_INPUT` error (§7).
pub fn validate(schema: &InputSchema, raw: &Value) -> Result<ResolvedInputs, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut resolved = ResolvedInputs::new();
    let empty = serde_json::Map::new();
    let raw_obj = raw.as_object().unwrap_or(&empty);

    for spec in &schema.fields {
        match raw_obj.get(&spec.name) {
            Some(value) => match coerce(value, spec.field_type) {
                Some(coerced) => {
                    if let Some(allowed) = &spec.enum_values {
                        if let Some(s) = coerced.as_str() {
                            if !allowed.iter().any(|a| a == s) {
                                errors.push(ValidationError {
                                    field: spec.name.clone(),
                                    reason: format!("{s:?} is not one of {allowed:?}"),
                                });
                                continue;
                            }
                        }
                    }
                    if !in_range(spec, &coerced) {
                        errors.push(ValidationError {
                            field: spec.name.clone(),
                            reason: format!(
                                "value out of range [{:?}, {:?}]",
                                spec.min, spec.max
                            ),
                        });
                        continue;
                    }
                    resolved.insert(spec.name.clone(), coerced);
                }
                None => errors.push(ValidationError {
                    field: spec.name.clone(),
                    reason: format!("could not coerce to {:?}", spec.field_type),
                }),
            },
            None => {
                if let Some(default) = &spec.default {
                    resolved.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    errors.push(ValidationError {
                        field: spec.name.clone(),
                        reason: "missing required field".into(),
                    });
                }
            }
        }
    }

    if schema.passthrough {
        let known: std::collections::HashSet<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        for (key, value) in raw_obj {
            if !known.contains(key.as_str()) {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> InputSchema {
        InputSchema {
            fields: vec![
                FieldSpec {
                    name: "prompt".into(),
                    field_type: FieldType::String,
                    required: true,
                    default: None,
                    min: None,
                    max: None,
                    enum_values: None,
                    advanced: false,
                    hidden: false,
                },
                FieldSpec {
                    name: "steps".into(),
                    field_type: FieldType::Number,
                    required: false,
                    default: Some(serde_json::json!(20)),
                    min: Some(1.0),
                    max: Some(50.0),
                    enum_values: None,
                    advanced: true,
                    hidden: false,
                },
            ],
            passthrough: false,
        }
    }

    #[test]
    fn missing_required_field_is_reported() {
        let errors = validate(&schema(), &serde_json::json!({})).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "prompt"));
    }

    #[test]
    fn default_applied_when_absent() {
        let resolved = validate(&schema(), &serde_json::json!({"prompt": "a cat"})).unwrap();
        assert_eq!(resolved["steps"], serde_json::json!(20));
    }

    #[test]
    fn out_of_range_is_reported_without_short_circuiting_other_fields() {
        let errors = validate(&schema(), &serde_json::json!({"steps": 999})).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "steps"));
        assert!(errors.iter().any(|e| e.field == "prompt"));
    }

    #[test]
    fn unknown_keys_dropped_unless_passthrough() {
        let mut s = schema();
        let resolved = validate(&s, &serde_json::json!({"prompt": "a cat", "extra": 1})).unwrap();
        assert!(!resolved.contains_key("extra"));
        s.passthrough = true;
        let resolved = validate(&s, &serde_json::json!({"prompt": "a cat", "extra": 1})).unwrap();
        assert_eq!(resolved["extra"], serde_json::json!(1));
    }

    #[test]
    fn string_field_coerces_a_numeric_value() {
        let resolved = validate(&schema(), &serde_json::json!({"prompt": 42})).unwrap();
        assert_eq!(resolved["prompt"], serde_json::json!("42"));
    }
}
