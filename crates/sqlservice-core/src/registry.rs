//! Declarative base: the set of models known to a database.

use crate::Result;
use crate::error::{Error, SchemaErrorKind};
use crate::schema::ModelSchema;
use std::collections::HashMap;

/// Collection of model schemas sharing one database.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    models: Vec<&'static ModelSchema>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, validating its relationships against their targets.
    pub fn register(&mut self, schema: &'static ModelSchema) -> Result<()> {
        if self.models.iter().any(|m| m.same_as(schema)) {
            return Ok(());
        }
        if let Some(existing) = self.get_by_table(schema.table()) {
            return Err(Error::schema(
                SchemaErrorKind::TableExists,
                format!(
                    "table '{}' is already mapped by {}",
                    schema.table(),
                    existing.name()
                ),
            ));
        }
        for rel in schema.relationships() {
            let target = rel.target();
            if let Some(missing) = rel
                .remote_keys
                .iter()
                .find(|key| target.column(key).is_none())
            {
                return Err(Error::schema(
                    SchemaErrorKind::ColumnNotFound,
                    format!(
                        "{}.{}: target {} has no column '{}'",
                        schema.name(),
                        rel.name,
                        target.name(),
                        missing
                    ),
                ));
            }
        }
        tracing::debug!(model = schema.name(), table = schema.table(), "registered model");
        self.models.push(schema);
        Ok(())
    }

    /// Builder-style [`Registry::register`].
    pub fn with(mut self, schema: &'static ModelSchema) -> Result<Self> {
        self.register(schema)?;
        Ok(self)
    }

    /// Models in registration order.
    pub fn models(&self) -> &[&'static ModelSchema] {
        &self.models
    }

    pub fn get(&self, name: &str) -> Option<&'static ModelSchema> {
        self.models.iter().copied().find(|m| m.name() == name)
    }

    pub fn get_by_table(&self, table: &str) -> Option<&'static ModelSchema> {
        self.models.iter().copied().find(|m| m.table() == table)
    }

    pub fn tables(&self) -> Vec<&'static str> {
        self.models.iter().map(|m| m.table()).collect()
    }

    /// Models ordered so that every table comes after the tables it references.
    ///
    /// Dependencies come from column foreign keys and `ManyToOne`
    /// relationships between registered models. Self references are ignored.
    pub fn sorted(&self) -> Result<Vec<&'static ModelSchema>> {
        let index: HashMap<&str, usize> = self
            .models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.table(), i))
            .collect();

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); self.models.len()];
        for (i, model) in self.models.iter().enumerate() {
            let fk_tables = model
                .columns()
                .iter()
                .filter_map(|c| c.foreign_key_target().map(|(table, _)| table));
            let rel_tables = model
                .relationships()
                .iter()
                .filter(|r| r.kind.local_holds_foreign_key())
                .map(|r| r.target().table());
            for table in fk_tables.chain(rel_tables) {
                if let Some(&j) = index.get(table) {
                    if j != i && !deps[i].contains(&j) {
                        deps[i].push(j);
                    }
                }
            }
        }

        let mut marks = vec![0u8; self.models.len()];
        let mut order = Vec::with_capacity(self.models.len());
        for i in 0..self.models.len() {
            visit(i, &deps, &mut marks, &mut order, &self.models)?;
        }
        Ok(order.into_iter().map(|i| self.models[i]).collect())
    }
}

/// Depth-first topological visit; marks are 0 = unvisited, 1 = in progress, 2 = done.
fn visit(
    i: usize,
    deps: &[Vec<usize>],
    marks: &mut [u8],
    out: &mut Vec<usize>,
    models: &[&'static ModelSchema],
) -> Result<()> {
    match marks[i] {
        2 => return Ok(()),
        1 => {
            return Err(Error::schema(
                SchemaErrorKind::DependencyCycle,
                format!("foreign keys of '{}' form a cycle", models[i].table()),
            ));
        }
        _ => {}
    }
    marks[i] = 1;
    for &j in &deps[i] {
        visit(j, deps, marks, out, models)?;
    }
    marks[i] = 2;
    out.push(i);
    Ok(())
}
