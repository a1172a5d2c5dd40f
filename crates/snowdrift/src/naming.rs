//! Naming rules shared by the table synchronizer and the loaders.

/// Catalog, schema and table parts of a qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

/// Split a stream name (`-` separated) or an object name (`.` separated).
///
/// One part is a table, two parts are `schema` and `table`, three or more
/// are `catalog`, `schema` and a table made of the remaining parts joined
/// with `_`.
pub fn split_qualified_name(name: &str, separator: char) -> QualifiedName {
    let parts: Vec<&str> = name.split(separator).collect();
    match parts.as_slice() {
        [schema, table] => QualifiedName {
            catalog: None,
            schema: Some(schema.to_string()),
            table: table.to_string(),
        },
        [catalog, schema, rest @ ..] if !rest.is_empty() => QualifiedName {
            catalog: Some(catalog.to_string()),
            schema: Some(schema.to_string()),
            table: rest.join("_"),
        },
        _ => QualifiedName {
            catalog: None,
            schema: None,
            table: name.to_string(),
        },
    }
}

/// Quoted, upper-cased table identifier for a stream, without schema.
pub fn table_name(stream: &str) -> String {
    let table = split_qualified_name(stream, '-').table.replace(['.', '-'], "_");
    format!("\"{}\"", table.to_uppercase())
}

/// Quoted, upper-cased column identifier.
pub fn safe_column_name(name: &str) -> String {
    format!("\"{}\"", name.to_uppercase())
}

/// Quoted element name used to address a field inside a semi-structured value.
pub fn json_element_name(name: &str) -> String {
    format!("\"{name}\"")
}

/// Expand `{{database}}`, `{{schema}}` and `{{table}}` in a query tag.
///
/// Values are unquoted and JSON escaped so the tag stays valid when it is
/// itself a JSON document.
pub fn query_tag(
    pattern: Option<&str>,
    database: Option<&str>,
    schema: Option<&str>,
    table: Option<&str>,
) -> Option<String> {
    let pattern = pattern.filter(|p| !p.is_empty())?;

    let escape = |value: Option<&str>| {
        value
            .map(|v| {
                let quoted = serde_json::Value::String(v.trim_matches('"').to_string()).to_string();
                quoted.trim_matches('"').to_string()
            })
            .unwrap_or_default()
    };

    Some(
        pattern
            .replace("{{database}}", &escape(database))
            .replace("{{schema}}", &escape(schema))
            .replace("{{table}}", &escape(table)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(catalog: Option<&str>, schema: Option<&str>, table: &str) -> QualifiedName {
        QualifiedName {
            catalog: catalog.map(String::from),
            schema: schema.map(String::from),
            table: table.to_string(),
        }
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(split_qualified_name("my_table", '-'), name(None, None, "my_table"));
        assert_eq!(
            split_qualified_name("my_schema-my_table", '-'),
            name(None, Some("my_schema"), "my_table")
        );
        assert_eq!(
            split_qualified_name("my_catalog-my_schema-my_table", '-'),
            name(Some("my_catalog"), Some("my_schema"), "my_table")
        );
    }

    #[test]
    fn test_dotted_object_names() {
        assert_eq!(split_qualified_name("my_table", '.'), name(None, None, "my_table"));
        assert_eq!(
            split_qualified_name("my_schema.my_table", '.'),
            name(None, Some("my_schema"), "my_table")
        );
        assert_eq!(
            split_qualified_name("my_catalog.my_schema.my_table", '.'),
            name(Some("my_catalog"), Some("my_schema"), "my_table")
        );
    }

    #[test]
    fn test_table_name_normalization() {
        assert_eq!(table_name("public-orders"), "\"ORDERS\"");
        assert_eq!(table_name("db-public-order.items"), "\"ORDER_ITEMS\"");
        assert_eq!(table_name("db-public-order-items"), "\"ORDER_ITEMS\"");
    }

    #[test]
    fn test_column_names() {
        assert_eq!(safe_column_name("c_obj__prop"), "\"C_OBJ__PROP\"");
        assert_eq!(json_element_name("c_obj__prop"), "\"c_obj__prop\"");
    }

    #[test]
    fn test_query_tag_tokens() {
        assert_eq!(query_tag(None, Some("db"), None, None), None);
        assert_eq!(
            query_tag(Some("static tag"), Some("db"), None, None).as_deref(),
            Some("static tag")
        );
        assert_eq!(
            query_tag(
                Some("Loading {{database}}.{{schema}}.{{table}}"),
                Some("DB"),
                Some("raw"),
                Some("\"ORDERS\""),
            )
            .as_deref(),
            Some("Loading DB.raw.ORDERS")
        );
        assert_eq!(
            query_tag(Some(r#"{"schema": "{{schema}}", "table": "{{table}}"}"#), None, Some("a\"b"), None)
                .as_deref(),
            Some(r#"{"schema": "a\"b", "table": ""}"#)
        );
    }
}
