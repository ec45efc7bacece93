pub mod inflect;
pub mod parser;
pub mod types;

pub use inflect::pluralize;
pub use parser::{parse_schema, parse_schema_json, parse_schema_yaml};
pub use types::*;

/// Fill in `dependencies` for every table from its columns: an `array`
/// column named after a known table, or a `*_id` column whose pluralized
/// stem is a known table. Existing entries are kept.
pub fn infer_dependencies(schema: &mut SchemaDocument) {
    let known: Vec<String> = schema.keys().cloned().collect();

    for descriptor in schema.values_mut() {
        let mut found = Vec::new();
        for (column, column_type) in &descriptor.columns {
            let target = if *column_type == ColumnType::Array && known.contains(column) {
                Some(column.clone())
            } else if let Some(stem) = column.strip_suffix(FOREIGN_KEY_SUFFIX) {
                let plural = pluralize(stem);
                known.contains(&plural).then_some(plural)
            } else {
                None
            };

            if let Some(target) = target {
                if target != descriptor.id && !descriptor.dependencies.contains(&target) {
                    found.push(target);
                }
            }
        }
        descriptor.dependencies.extend(found);
    }
}
