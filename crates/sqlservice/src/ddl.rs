//! Schema DDL generation.
//!
//! Renders `CREATE TABLE` and `DROP TABLE` statements for registered models
//! in the connection's dialect. Tables are created parents first so foreign
//! key constraints always reference an existing table, and dropped in the
//! reverse order.

use sqlservice_core::{Column, Dialect, ModelSchema, Registry, Result, SqlType};

/// `CREATE TABLE` for one model.
///
/// Primary key, unique and foreign key constraints are emitted as table
/// constraints. On SQLite a single auto-increment key is declared inline as
/// `INTEGER PRIMARY KEY AUTOINCREMENT`, the only form SQLite accepts.
pub fn create_table_sql(schema: &ModelSchema, dialect: Dialect, if_not_exists: bool) -> String {
    let q = |name: &str| dialect.quote_identifier(name);
    let table = schema.table();

    let mut sql = String::from("CREATE TABLE ");
    if if_not_exists {
        sql.push_str("IF NOT EXISTS ");
    }
    sql.push_str(&q(table));
    sql.push_str(" (\n  ");

    let inline_key = dialect == Dialect::Sqlite
        && schema.primary_key().len() == 1
        && schema.auto_increment_column().is_some_and(|c| c.primary_key);

    let mut parts: Vec<String> = schema
        .columns()
        .iter()
        .map(|column| column_definition(column, dialect, inline_key))
        .collect();

    if !schema.primary_key().is_empty() && !inline_key {
        let keys: Vec<String> = schema.primary_key().iter().map(|k| q(k)).collect();
        parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    for column in schema.columns() {
        if column.unique && !column.primary_key {
            parts.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                q(&format!("uk_{}_{}", table, column.name)),
                q(column.name)
            ));
        }
    }
    for column in schema.columns() {
        if let Some((target_table, target_column)) = column.foreign_key_target() {
            parts.push(format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                q(&format!("fk_{}_{}", table, column.name)),
                q(column.name),
                q(target_table),
                q(target_column)
            ));
        }
    }

    sql.push_str(&parts.join(",\n  "));
    sql.push_str("\n)");
    sql
}

/// `DROP TABLE` for one model.
pub fn drop_table_sql(schema: &ModelSchema, dialect: Dialect, if_exists: bool) -> String {
    if if_exists {
        format!("DROP TABLE IF EXISTS {}", dialect.quote_identifier(schema.table()))
    } else {
        format!("DROP TABLE {}", dialect.quote_identifier(schema.table()))
    }
}

/// `CREATE TABLE IF NOT EXISTS` for every registered model, parents first.
pub fn create_all_sql(registry: &Registry, dialect: Dialect) -> Result<Vec<String>> {
    Ok(registry
        .sorted()?
        .into_iter()
        .map(|schema| create_table_sql(schema, dialect, true))
        .collect())
}

/// `DROP TABLE IF EXISTS` for every registered model, children first.
pub fn drop_all_sql(registry: &Registry, dialect: Dialect) -> Result<Vec<String>> {
    Ok(registry
        .sorted()?
        .into_iter()
        .rev()
        .map(|schema| drop_table_sql(schema, dialect, true))
        .collect())
}

fn column_definition(column: &Column, dialect: Dialect, inline_key: bool) -> String {
    let mut def = format!(
        "{} {}",
        dialect.quote_identifier(column.name),
        column_type(column, dialect, inline_key)
    );

    if column.auto_increment {
        match dialect {
            Dialect::Sqlite if inline_key && column.primary_key => {
                def.push_str(" PRIMARY KEY AUTOINCREMENT");
            }
            Dialect::Sqlite => {}
            Dialect::Postgres => def.push_str(" GENERATED BY DEFAULT AS IDENTITY"),
            Dialect::Mysql => def.push_str(" NOT NULL AUTO_INCREMENT"),
        }
    } else if !column.nullable {
        def.push_str(" NOT NULL");
    }

    if let Some(default) = column.default {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    def
}

fn column_type(column: &Column, dialect: Dialect, inline_key: bool) -> String {
    match (dialect, column.sql_type) {
        // Only the exact spelling INTEGER aliases the rowid.
        (Dialect::Sqlite, _) if inline_key && column.auto_increment => "INTEGER".to_string(),
        (Dialect::Postgres, SqlType::Blob) => "BYTEA".to_string(),
        (Dialect::Mysql, SqlType::Uuid) => "CHAR(36)".to_string(),
        (Dialect::Mysql, SqlType::TimestampTz) => "TIMESTAMP".to_string(),
        (_, sql_type) => sql_type.sql_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlservice_core::{Error, SchemaErrorKind};
    use std::sync::LazyLock;

    static AUTHORS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Author", "authors")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("email", SqlType::VarChar(255)).not_null().unique())
            .column(Column::new("joined", SqlType::Timestamp).default("CURRENT_TIMESTAMP"))
            .build()
            .expect("valid authors schema")
    });

    static BOOKS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Book", "books")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("author_id", SqlType::BigInt).foreign_key("authors.id"))
            .column(Column::new("title", SqlType::Text).not_null())
            .build()
            .expect("valid books schema")
    });

    static TAGS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Tag", "book_tags")
            .column(Column::new("book_id", SqlType::BigInt).primary_key().foreign_key("books.id"))
            .column(Column::new("tag", SqlType::Text).primary_key())
            .build()
            .expect("valid tags schema")
    });

    #[test]
    fn postgres_create_table() {
        assert_eq!(
            create_table_sql(&AUTHORS, Dialect::Postgres, false),
            "CREATE TABLE \"authors\" (\n  \
             \"id\" BIGINT GENERATED BY DEFAULT AS IDENTITY,\n  \
             \"email\" VARCHAR(255) NOT NULL,\n  \
             \"joined\" TIMESTAMP DEFAULT CURRENT_TIMESTAMP,\n  \
             PRIMARY KEY (\"id\"),\n  \
             CONSTRAINT \"uk_authors_email\" UNIQUE (\"email\")\n)"
        );
    }

    #[test]
    fn sqlite_inlines_the_autoincrement_key() {
        let sql = create_table_sql(&BOOKS, Dialect::Sqlite, true);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"books\""), "{sql}");
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"), "{sql}");
        assert!(!sql.contains("PRIMARY KEY (\"id\")"), "{sql}");
        assert!(
            sql.contains(
                "CONSTRAINT \"fk_books_author_id\" FOREIGN KEY (\"author_id\") REFERENCES \"authors\" (\"id\")"
            ),
            "{sql}"
        );
    }

    #[test]
    fn mysql_uses_backticks_and_auto_increment() {
        let sql = create_table_sql(&BOOKS, Dialect::Mysql, false);
        assert!(sql.contains("`id` BIGINT NOT NULL AUTO_INCREMENT"), "{sql}");
        assert!(sql.contains("`title` TEXT NOT NULL"), "{sql}");
        assert!(sql.contains("PRIMARY KEY (`id`)"), "{sql}");
    }

    #[test]
    fn composite_keys_become_a_table_constraint() {
        let sql = create_table_sql(&TAGS, Dialect::Sqlite, false);
        assert!(sql.contains("PRIMARY KEY (\"book_id\", \"tag\")"), "{sql}");
        assert!(sql.contains("\"book_id\" BIGINT NOT NULL"), "{sql}");
    }

    #[test]
    fn create_all_orders_parents_first_and_drop_all_reverses() {
        let registry = Registry::new()
            .with(&TAGS)
            .and_then(|r| r.with(&BOOKS))
            .and_then(|r| r.with(&AUTHORS))
            .expect("registry");

        let created = create_all_sql(&registry, Dialect::Postgres).unwrap();
        let order: Vec<usize> = ["\"authors\"", "\"books\"", "\"book_tags\""]
            .iter()
            .map(|t| {
                created
                    .iter()
                    .position(|s| s.starts_with(&format!("CREATE TABLE IF NOT EXISTS {t}")))
                    .expect("table created")
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);

        assert_eq!(
            drop_all_sql(&registry, Dialect::Postgres).unwrap(),
            vec![
                "DROP TABLE IF EXISTS \"book_tags\"",
                "DROP TABLE IF EXISTS \"books\"",
                "DROP TABLE IF EXISTS \"authors\"",
            ]
        );
    }

    #[test]
    fn foreign_key_cycles_fail() {
        static LEFT: LazyLock<ModelSchema> = LazyLock::new(|| {
            ModelSchema::builder("Left", "lefts")
                .column(Column::new("id", SqlType::BigInt).primary_key())
                .column(Column::new("right_id", SqlType::BigInt).foreign_key("rights.id"))
                .build()
                .expect("valid lefts schema")
        });
        static RIGHT: LazyLock<ModelSchema> = LazyLock::new(|| {
            ModelSchema::builder("Right", "rights")
                .column(Column::new("id", SqlType::BigInt).primary_key())
                .column(Column::new("left_id", SqlType::BigInt).foreign_key("lefts.id"))
                .build()
                .expect("valid rights schema")
        });
        let registry = Registry::new()
            .with(&LEFT)
            .and_then(|r| r.with(&RIGHT))
            .expect("registry");

        match create_all_sql(&registry, Dialect::Sqlite) {
            Err(Error::Schema(e)) => assert_eq!(e.kind, SchemaErrorKind::DependencyCycle),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }
}
