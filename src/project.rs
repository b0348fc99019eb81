use std::io;

use serde::Serialize;
use serde_json::Value;

use crate::schema::{is_nested, FlatField};

/// Projects one nested row onto the flattened schema.
///
/// Returns exactly one value per field, in field order, so every output
/// row is rectangular. A missing key or a non-object met partway along a
/// path resolves to null; partial rows are expected, not an error.
pub fn project(raw: &Value, fields: &[FlatField], expand_nested: bool) -> Vec<Value> {
    fields
        .iter()
        .map(|field| project_field(raw, field, expand_nested))
        .collect()
}

fn project_field(raw: &Value, field: &FlatField, expand_nested: bool) -> Value {
    let mut value = raw;
    for name_part in &field.path {
        match value.get(name_part) {
            Some(next) if !next.is_null() => value = next,
            _ => return Value::Null,
        }
    }

    // Without expansion a RECORD column survives flattening as one field;
    // its whole subtree is carried as JSON text.
    if !expand_nested && is_nested(&field.datatype) {
        return Value::String(json_text(value));
    }
    value.clone()
}

/// Renders one projected value as a CSV cell.
///
/// Null becomes an empty field; strings pass through unquoted (the csv
/// writer adds quoting as needed); anything still structured, such as a
/// REPEATED leaf, falls back to its JSON text.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => json_text(other),
    }
}

// One line with a space after each `,` and `:`, the cell format the
// original tool emitted for nested values.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn json_text(value: &Value) -> String {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    // Writing a Value into a Vec cannot fail.
    value
        .serialize(&mut ser)
        .expect("serializing a JSON value to memory");
    String::from_utf8(out).expect("serializer emits UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::flatten;
    use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
    use serde_json::json;

    fn address_schema() -> Vec<TableFieldSchema> {
        vec![
            TableFieldSchema::integer("id"),
            TableFieldSchema::record("addr", vec![TableFieldSchema::string("city")]),
        ]
    }

    #[test]
    fn test_project_expanded_extracts_leaves() {
        let fields = flatten(&address_schema(), true);
        let row = json!({"id": 1, "addr": {"city": "X"}});
        let values = project(&row, &fields, true);
        assert_eq!(values, vec![json!(1), json!("X")]);
    }

    #[test]
    fn test_project_unexpanded_serializes_record_as_json_text() {
        let fields = flatten(&address_schema(), false);
        let row = json!({"id": 1, "addr": {"city": "X"}});
        let values = project(&row, &fields, false);
        assert_eq!(values[0], json!(1));
        assert_eq!(values[1], json!(r#"{"city": "X"}"#));
    }

    #[test]
    fn test_serialized_record_keeps_field_order_and_spacing() {
        let schema = vec![TableFieldSchema::record(
            "addr",
            vec![
                TableFieldSchema::string("city"),
                TableFieldSchema::string("zip"),
            ],
        )];
        let fields = flatten(&schema, false);
        let row = json!({"addr": {"city": "X", "zip": "99"}});
        let values = project(&row, &fields, false);
        assert_eq!(values[0], json!(r#"{"city": "X", "zip": "99"}"#));
    }

    #[test]
    fn test_project_missing_intermediate_key_yields_null() {
        let fields = flatten(&address_schema(), true);
        let row = json!({"id": 2});
        let values = project(&row, &fields, true);
        assert_eq!(values, vec![json!(2), Value::Null]);
    }

    #[test]
    fn test_project_scalar_met_partway_yields_null() {
        // addr is a string here, not an object; the path addr.city cannot
        // continue and must degrade to null rather than error.
        let fields = flatten(&address_schema(), true);
        let row = json!({"id": 3, "addr": "not-a-record"});
        let values = project(&row, &fields, true);
        assert_eq!(values, vec![json!(3), Value::Null]);
    }

    #[test]
    fn test_project_is_rectangular_for_any_row() {
        let fields = flatten(&address_schema(), true);
        for row in [json!({}), json!({"id": 1}), json!({"unrelated": true})] {
            assert_eq!(project(&row, &fields, true).len(), fields.len());
        }
    }

    #[test]
    fn test_render_scalars() {
        assert_eq!(render(&Value::Null), "");
        assert_eq!(render(&json!("plain")), "plain");
        assert_eq!(render(&json!(7)), "7");
        assert_eq!(render(&json!(2.5)), "2.5");
        assert_eq!(render(&json!(true)), "true");
        assert_eq!(render(&json!(["a", "b"])), r#"["a", "b"]"#);
    }
}
