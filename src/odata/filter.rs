//! Helpers for building `$filter` expressions

use uuid::Uuid;

/// Quote a string literal, doubling embedded single quotes
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `field eq 'value'`
pub fn eq(field: &str, value: &str) -> String {
    format!("{} eq {}", field, string_literal(value))
}

/// `contains(field,'value')`
pub fn contains(field: &str, value: &str) -> String {
    format!("contains({},{})", field, string_literal(value))
}

/// Match `field` against any of `ids`; GUID literals are unquoted in OData v4
pub fn any_guid<'a, I>(field: &str, ids: I) -> String
where
    I: IntoIterator<Item = &'a Uuid>,
{
    let clauses: Vec<String> = ids
        .into_iter()
        .map(|id| format!("{} eq {}", field, id.hyphenated()))
        .collect();

    match clauses.len() {
        0 => "false".to_string(),
        1 => clauses.into_iter().next().unwrap_or_default(),
        _ => format!("({})", clauses.join(" or ")),
    }
}

/// Join clauses with `and`
pub fn and_all(clauses: &[String]) -> String {
    clauses.join(" and ")
}
