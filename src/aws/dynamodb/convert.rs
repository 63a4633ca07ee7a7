//! Conversion between JSON values and DynamoDB attribute values.
//!
//! DynamoDB stores numbers as decimal strings, JSON handlers work with
//! [`serde_json::Value`]. This module is the single place where the two
//! representations meet: [`to_attribute_value`] and [`from_attribute_value`]
//! recurse through nested maps and lists and translate numbers in both
//! directions. With the `arbitrary_precision` feature of `serde_json` the
//! decimal string is carried verbatim, so a round trip is lossless.

use anyhow::{Context, bail};
use aws_sdk_dynamodb::types::AttributeValue;
use serde_json::Value;
use std::collections::HashMap;

/// Translates a JSON value into a DynamoDB attribute value.
pub fn to_attribute_value(value: &Value) -> anyhow::Result<AttributeValue> {
    match value {
        Value::Null => Ok(AttributeValue::Null(true)),
        Value::Bool(flag) => Ok(AttributeValue::Bool(*flag)),
        Value::Number(number) => Ok(AttributeValue::N(number.to_string())),
        Value::String(string) => Ok(AttributeValue::S(string.clone())),
        Value::Array(values) => Ok(AttributeValue::L(
            values
                .iter()
                .map(to_attribute_value)
                .collect::<anyhow::Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut item = HashMap::with_capacity(map.len());
            for (key, value) in map {
                item.insert(key.clone(), to_attribute_value(value)?);
            }
            Ok(AttributeValue::M(item))
        }
    }
}

/// Translates a DynamoDB attribute value back into a JSON value.
pub fn from_attribute_value(value: &AttributeValue) -> anyhow::Result<Value> {
    match value {
        AttributeValue::Null(_) => Ok(Value::Null),
        AttributeValue::Bool(flag) => Ok(Value::Bool(*flag)),
        AttributeValue::N(number) => Ok(Value::Number(
            serde_json::from_str(number)
                .with_context(|| format!("Invalid numeric attribute '{}'", number))?,
        )),
        AttributeValue::S(string) => Ok(Value::String(string.clone())),
        AttributeValue::L(values) => Ok(Value::Array(
            values
                .iter()
                .map(from_attribute_value)
                .collect::<anyhow::Result<Vec<_>>>()?,
        )),
        AttributeValue::M(map) => {
            let mut object = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                object.insert(key.clone(), from_attribute_value(value)?);
            }
            Ok(Value::Object(object))
        }
        AttributeValue::Ss(strings) => Ok(Value::Array(
            strings.iter().cloned().map(Value::String).collect(),
        )),
        other => bail!("Unsupported attribute value type: {:?}", other),
    }
}

/// Translates a JSON object into a DynamoDB item map. Fails for non-object
/// values, which cannot form an item.
pub fn to_item(value: &Value) -> anyhow::Result<HashMap<String, AttributeValue>> {
    match to_attribute_value(value)? {
        AttributeValue::M(item) => Ok(item),
        _ => bail!("Only JSON objects can be stored as items"),
    }
}

/// Translates a DynamoDB item map into a JSON object.
pub fn from_item(item: &HashMap<String, AttributeValue>) -> anyhow::Result<Value> {
    from_attribute_value(&AttributeValue::M(item.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(value: Value) -> Value {
        from_attribute_value(&to_attribute_value(&value).unwrap()).unwrap()
    }

    #[test]
    fn scalars_survive_a_round_trip() {
        assert_eq!(round_trip(json!(null)), json!(null));
        assert_eq!(round_trip(json!(true)), json!(true));
        assert_eq!(round_trip(json!("saffron")), json!("saffron"));
        assert_eq!(round_trip(json!(42)), json!(42));
        assert_eq!(round_trip(json!(-7)), json!(-7));
    }

    #[test]
    fn floats_survive_a_round_trip_exactly() {
        for score in [0.1, 0.2, 0.30000000000000004, 1.0 / 3.0, 982.125, 1e-12] {
            let value = round_trip(json!(score));
            assert_eq!(value.as_f64().unwrap(), score);
        }
    }

    #[test]
    fn numbers_become_decimal_strings() {
        let attribute = to_attribute_value(&json!(0.85)).unwrap();
        assert_eq!(attribute, AttributeValue::N("0.85".to_string()));
    }

    #[test]
    fn nested_structures_recurse() {
        let value = json!({
            "items": [
                {"item_id": "sku-1", "score": 0.91},
                {"item_id": "sku-2", "score": 0.87}
            ],
            "counts": {"sent": 10, "clicked": 3},
            "active": true,
            "note": null
        });

        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn list_order_is_preserved() {
        let value = json!([3, 1, 2, {"a": [9, 8]}]);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn string_sets_map_to_arrays() {
        let attribute = AttributeValue::Ss(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(from_attribute_value(&attribute).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn binary_attributes_are_rejected() {
        let attribute = AttributeValue::B(aws_sdk_dynamodb::primitives::Blob::new(vec![1, 2]));
        assert!(from_attribute_value(&attribute).is_err());
    }

    #[test]
    fn garbage_numeric_strings_are_rejected() {
        assert!(from_attribute_value(&AttributeValue::N("not-a-number".to_string())).is_err());
    }

    #[test]
    fn only_objects_form_items() {
        assert!(to_item(&json!({"pk": "a"})).is_ok());
        assert!(to_item(&json!([1, 2, 3])).is_err());
    }
}
