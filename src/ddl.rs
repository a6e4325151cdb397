//! Table provisioning for the parent and target tables.
//!
//! Outside the load path: the pipeline never creates or alters tables.

use pg_escape::quote_identifier;

use crate::config::TargetSchema;
use crate::identity::Identifier;
use crate::store::{PgStore, StoreError};

/// `CREATE TABLE IF NOT EXISTS` for the parent table, keyed by a generated UUID.
pub fn create_parent_table_sql(schema: &TargetSchema) -> String {
    let mut columns = vec![format!(
        "{} UUID PRIMARY KEY DEFAULT gen_random_uuid()",
        quote_identifier(&schema.parent_key)
    )];
    columns.extend(
        schema
            .parent_columns
            .iter()
            .map(|c| format!("{} TEXT NOT NULL", quote_identifier(c))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_identifier(&schema.parent_table),
        columns.join(",\n    ")
    )
}

/// `CREATE TABLE IF NOT EXISTS` for the target table with its foreign key.
pub fn create_target_table_sql(schema: &TargetSchema) -> String {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let mut def = format!("{} {}", quote_identifier(&col.name), col.ty.sql_type());
            if schema.primary_key == Some(idx) {
                def.push_str(" PRIMARY KEY");
                if col.ty == crate::config::ColumnType::Identifier {
                    def.push_str(" DEFAULT gen_random_uuid()");
                }
            } else if !col.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    columns.push(format!(
        "FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE CASCADE ON DELETE CASCADE",
        quote_identifier(&schema.foreign_key_column().name),
        quote_identifier(&schema.parent_table),
        quote_identifier(&schema.parent_key)
    ));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_identifier(&schema.table),
        columns.join(",\n    ")
    )
}

/// Create both tables. `gen_random_uuid()` needs pgcrypto before PostgreSQL 13.
pub async fn create_tables(store: &PgStore, schema: &TargetSchema) -> Result<(), StoreError> {
    let sql = format!(
        "CREATE EXTENSION IF NOT EXISTS pgcrypto;\n{};\n{};",
        create_parent_table_sql(schema),
        create_target_table_sql(schema)
    );
    store.client().batch_execute(&sql).await?;
    tracing::info!(
        parent = %schema.parent_table,
        target = %schema.table,
        "tables created"
    );
    Ok(())
}

/// Drop the target table, then the parent it references.
pub async fn drop_tables(store: &PgStore, schema: &TargetSchema) -> Result<(), StoreError> {
    let sql = format!(
        "DROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};",
        quote_identifier(&schema.table),
        quote_identifier(&schema.parent_table)
    );
    store.client().batch_execute(&sql).await?;
    tracing::info!(
        parent = %schema.parent_table,
        target = %schema.table,
        "tables dropped"
    );
    Ok(())
}

/// Insert `count` placeholder parents and return their generated keys.
pub async fn seed_parents(
    store: &PgStore,
    schema: &TargetSchema,
    count: u32,
) -> Result<Vec<Identifier>, StoreError> {
    let count = i32::try_from(count)
        .map_err(|_| StoreError::Other(format!("seed count {count} is too large")))?;

    let (columns, values) = if schema.parent_columns.is_empty() {
        (String::new(), String::new())
    } else {
        let columns = schema
            .parent_columns
            .iter()
            .map(|c| quote_identifier(c).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        let values = schema
            .parent_columns
            .iter()
            .map(|c| format!("'{}-' || g", c.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        (format!("({columns})"), format!(" {values}"))
    };
    let select = if values.is_empty() {
        // no text columns to fill: still need one row per g
        "SELECT FROM generate_series(1, $1::int4) AS g".to_string()
    } else {
        format!("SELECT{values} FROM generate_series(1, $1::int4) AS g")
    };
    let sql = format!(
        "INSERT INTO {} {} {} RETURNING {}",
        quote_identifier(&schema.parent_table),
        columns,
        select,
        quote_identifier(&schema.parent_key)
    );

    let rows = store.client().query(sql.as_str(), &[&count]).await?;
    let ids = rows
        .iter()
        .map(|row| row.try_get::<_, uuid::Uuid>(0).map(Identifier::from))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(table = %schema.parent_table, seeded = ids.len(), "parents seeded");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_table_references_parent() {
        let sql = create_target_table_sql(&TargetSchema::default());
        assert!(sql.contains("order_id UUID PRIMARY KEY DEFAULT gen_random_uuid()"));
        assert!(sql.contains("quantity INTEGER NOT NULL"));
        assert!(sql.contains("REFERENCES customers (customer_id) ON UPDATE CASCADE ON DELETE CASCADE"));
    }

    #[test]
    fn parent_table_has_text_columns() {
        let sql = create_parent_table_sql(&TargetSchema::default());
        assert!(sql.contains("customer_id UUID PRIMARY KEY"));
        assert!(sql.contains("first_name TEXT NOT NULL"));
        assert!(sql.contains("last_name TEXT NOT NULL"));
    }
}
