//! JSON serialization of model instances.

use crate::record::{Instance, Record, Related};
use std::collections::HashSet;

/// Options for [`Record::to_json`] and [`Instance::to_json`].
///
/// By default columns and top-level relationships are included while the
/// relationships of nested objects are not.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    pub exclude_relationships: bool,
    pub include_nested_relationships: bool,
}

impl DumpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_relationships(mut self, value: bool) -> Self {
        self.exclude_relationships = value;
        self
    }

    pub fn include_nested_relationships(mut self, value: bool) -> Self {
        self.include_nested_relationships = value;
        self
    }
}

impl Record {
    /// Serialize set columns (and, per `options`, relationships) to a JSON object.
    ///
    /// Unset columns are omitted. An object that was already serialized
    /// higher up in the graph is skipped, which breaks relationship cycles.
    pub fn to_json(&self, options: &DumpOptions) -> serde_json::Value {
        dump_record(self, options, 0, &mut HashSet::new())
    }
}

impl Instance {
    pub fn to_json(&self, options: &DumpOptions) -> serde_json::Value {
        let mut seen = HashSet::from([self.address()]);
        let record = self.read();
        dump_record(&record, options, 0, &mut seen)
    }
}

fn dump_instance(
    instance: &Instance,
    options: &DumpOptions,
    depth: usize,
    seen: &mut HashSet<usize>,
) -> Option<serde_json::Value> {
    if !seen.insert(instance.address()) {
        return None;
    }
    let record = instance.read();
    Some(dump_record(&record, options, depth, seen))
}

fn dump_record(
    record: &Record,
    options: &DumpOptions,
    depth: usize,
    seen: &mut HashSet<usize>,
) -> serde_json::Value {
    let mut data = serde_json::Map::new();
    for (column, value) in record.set_values() {
        data.insert(column.name.to_string(), value.to_json());
    }

    let include_relationships = if depth == 0 {
        !options.exclude_relationships
    } else {
        options.include_nested_relationships
    };
    if include_relationships {
        for (rel, related) in record.relations() {
            match related {
                Related::One(None) => {
                    data.insert(rel.name.to_string(), serde_json::Value::Null);
                }
                Related::One(Some(instance)) => {
                    if let Some(value) = dump_instance(instance, options, depth + 1, seen) {
                        data.insert(rel.name.to_string(), value);
                    }
                }
                Related::Many(instances) => {
                    let items = instances
                        .iter()
                        .filter_map(|i| dump_instance(i, options, depth + 1, seen))
                        .collect();
                    data.insert(rel.name.to_string(), serde_json::Value::Array(items));
                }
            }
        }
    }

    serde_json::Value::Object(data)
}
