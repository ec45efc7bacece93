//! Decycle/retrocycle for persisted live tables.
//!
//! Joined rows point at each other (links one way, back-references the
//! other), so they are written out as flat data plus path markers:
//!
//! ```json
//! {"id": 1, "user_id": 2,
//!  "$join": {"links": {"user": {"$ref": "$.tables.users[2]"}},
//!            "lists": {}, "back_refs": {"payments": [{"$ref": "$.tables.payments[9]"}]}}}
//! ```
//!
//! Loading rebuilds the rows straight into the join index, without
//! re-running the join.

use crate::error::{HippoDbError, Result};
use crate::graph::{JoinGraph, Link, Row, RowKey};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const JOIN_KEY: &str = "$join";
const REF_KEY: &str = "$ref";
const PATH_PREFIX: &str = "$.tables.";

fn marker(table: &str, key: &RowKey) -> Value {
    json!({ REF_KEY: format!("{PATH_PREFIX}{table}[{}]", key.to_value()) })
}

fn parse_marker(value: &Value) -> Result<(String, RowKey)> {
    let path = value
        .get(REF_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| HippoDbError::Cache(format!("Not a row marker: {value}")))?;
    let bad = || HippoDbError::Cache(format!("Malformed row marker `{path}`"));

    let rest = path.strip_prefix(PATH_PREFIX).ok_or_else(bad)?;
    let open = rest.find('[').ok_or_else(bad)?;
    let table = &rest[..open];
    let id_json = rest[open + 1..].strip_suffix(']').ok_or_else(bad)?;
    let id: Value = serde_json::from_str(id_json).map_err(|_| bad())?;
    let key = RowKey::from_value(&id).ok_or_else(bad)?;
    Ok((table.to_string(), key))
}

fn markers(table: &str, keys: &[RowKey]) -> Value {
    Value::Array(keys.iter().map(|k| marker(table, k)).collect())
}

fn parse_markers(value: &Value) -> Result<Vec<(String, RowKey)>> {
    value
        .as_array()
        .map(|items| items.iter().map(parse_marker).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
}

/// Serialize one live table, in live order.
pub fn decycle_table(graph: &JoinGraph, table: &str) -> Option<Value> {
    let rows = graph.rows(table)?;
    let mut out = Vec::with_capacity(rows.len());

    for view in rows {
        let row = view.row();
        let mut data = row.data().clone();

        let links: Map<String, Value> = row
            .links()
            .iter()
            .map(|(stem, link)| (stem.clone(), marker(&link.table, &link.key)))
            .collect();
        let lists: Map<String, Value> = row
            .lists()
            .iter()
            .map(|(column, keys)| (column.clone(), markers(column, keys)))
            .collect();
        let back_refs: Map<String, Value> = row
            .back_refs()
            .iter()
            .map(|(from, keys)| (from.clone(), markers(from, keys)))
            .collect();

        data.insert(
            JOIN_KEY.to_string(),
            json!({ "links": links, "lists": lists, "back_refs": back_refs }),
        );
        out.push(Value::Object(data));
    }

    Some(Value::Array(out))
}

/// Rebuild decycled tables into `graph`. Returns the live order of each
/// table that was installed.
pub fn retrocycle_tables(
    graph: &mut JoinGraph,
    tables: &Map<String, Value>,
) -> Result<Vec<(String, Vec<RowKey>)>> {
    let mut installed = Vec::new();

    for (table, rows) in tables {
        let rows = rows.as_array().ok_or_else(|| {
            HippoDbError::Cache(format!("Cached table `{table}` is not an array"))
        })?;

        let mut order = Vec::with_capacity(rows.len());
        let mut rebuilt = Vec::with_capacity(rows.len());
        for raw in rows {
            let mut data = raw.as_object().cloned().ok_or_else(|| {
                HippoDbError::Cache(format!("Cached row in `{table}` is not an object"))
            })?;
            let join = data.remove(JOIN_KEY).unwrap_or(Value::Null);
            let key = data.get("id").and_then(RowKey::from_value).ok_or_else(|| {
                HippoDbError::Cache(format!("Cached row in `{table}` has no id"))
            })?;

            let mut row = Row::new(table, key.clone(), data);
            if let Some(links) = join.get("links").and_then(Value::as_object) {
                for (stem, m) in links {
                    let (target, target_key) = parse_marker(m)?;
                    row.links.insert(
                        stem.clone(),
                        Link {
                            table: target,
                            key: target_key,
                        },
                    );
                }
            }
            if let Some(lists) = join.get("lists").and_then(Value::as_object) {
                for (column, ms) in lists {
                    let keys = parse_markers(ms)?.into_iter().map(|(_, k)| k).collect();
                    row.lists.insert(column.clone(), keys);
                }
            }
            if let Some(back_refs) = join.get("back_refs").and_then(Value::as_object) {
                let mut buckets: BTreeMap<String, Vec<RowKey>> = BTreeMap::new();
                for (from, ms) in back_refs {
                    let keys = parse_markers(ms)?.into_iter().map(|(_, k)| k).collect();
                    buckets.insert(from.clone(), keys);
                }
                row.back_refs = buckets;
            }

            order.push(key);
            rebuilt.push(row);
        }

        graph.create_table(table);
        for row in rebuilt {
            graph.store_row(row);
        }
        for key in &order {
            graph.push_live(table, key.clone());
        }
        log::debug!("restored {} cached rows into `{table}`", order.len());
        installed.push((table.clone(), order));
    }

    Ok(installed)
}
