use gcp_bigquery_client::model::field_type::FieldType;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;

/// One column of the flattened output schema.
///
/// `path` holds the field name at each nesting level, outer to inner;
/// `display_name` is the path joined with `.` and becomes the CSV header.
#[derive(Debug, Clone)]
pub struct FlatField {
    pub path: Vec<String>,
    pub display_name: String,
    pub datatype: FieldType,
}

impl FlatField {
    fn new(path: Vec<String>, datatype: FieldType) -> Self {
        let display_name = path.join(".");
        Self {
            path,
            display_name,
            datatype,
        }
    }
}

/// BigQuery reports nested columns as RECORD (legacy) or STRUCT.
pub fn is_nested(datatype: &FieldType) -> bool {
    matches!(datatype, FieldType::Record | FieldType::Struct)
}

/// Flattens the multi-level result schema into an ordered list of fields.
///
/// Depth-first, left to right, preserving sibling order at every level.
/// With `expand_nested` a RECORD column contributes one field per leaf
/// descendant (dotted path); without it the RECORD itself becomes a single
/// field and its values are later serialized as JSON text.
pub fn flatten(schema: &[TableFieldSchema], expand_nested: bool) -> Vec<FlatField> {
    let mut out = Vec::new();
    walk(schema, expand_nested, &[], &mut out);
    out
}

fn walk(columns: &[TableFieldSchema], expand_nested: bool, prefix: &[String], out: &mut Vec<FlatField>) {
    for column in columns {
        let mut path = prefix.to_vec();
        path.push(column.name.clone());

        if expand_nested && is_nested(&column.r#type) {
            let children = column.fields.as_deref().unwrap_or(&[]);
            walk(children, expand_nested, &path, out);
        } else {
            out.push(FlatField::new(path, column.r#type.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_schema() -> Vec<TableFieldSchema> {
        vec![
            TableFieldSchema::integer("id"),
            TableFieldSchema::record(
                "addr",
                vec![
                    TableFieldSchema::string("city"),
                    TableFieldSchema::string("zip"),
                ],
            ),
            TableFieldSchema::string("name"),
        ]
    }

    #[test]
    fn test_flatten_without_expansion_keeps_top_level_order() {
        let fields = flatten(&address_schema(), false);
        let names: Vec<&str> = fields.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["id", "addr", "name"]);
        assert!(is_nested(&fields[1].datatype));
    }

    #[test]
    fn test_flatten_with_expansion_emits_leaves_with_dotted_paths() {
        let fields = flatten(&address_schema(), true);
        let names: Vec<&str> = fields.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["id", "addr.city", "addr.zip", "name"]);
        assert!(fields.iter().all(|f| !is_nested(&f.datatype)));
    }

    #[test]
    fn test_flatten_expands_multiple_levels() {
        let schema = vec![TableFieldSchema::record(
            "a",
            vec![
                TableFieldSchema::record("b", vec![TableFieldSchema::float("x")]),
                TableFieldSchema::bool("flag"),
            ],
        )];
        let fields = flatten(&schema, true);
        let names: Vec<&str> = fields.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["a.b.x", "a.flag"]);
        assert_eq!(fields[0].path, vec!["a", "b", "x"]);
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let schema = address_schema();
        for expand in [false, true] {
            let first = flatten(&schema, expand);
            let second = flatten(&schema, expand);
            assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(&second) {
                assert_eq!(a.path, b.path);
                assert_eq!(a.display_name, b.display_name);
            }
        }
    }

    #[test]
    fn test_flatten_empty_schema() {
        assert!(flatten(&[], true).is_empty());
        assert!(flatten(&[], false).is_empty());
    }
}
