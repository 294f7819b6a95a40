//! SQLite persistence for adjusted transactions and feature sets.
//!
//! Feature tables are created on first write from the table's schema and
//! registered in `feature_schemas` with their fingerprint. Later writes must
//! carry the same fingerprint. Rows are replaced per anchor day.
//!
//! SQLite stores NaN as NULL, so a NaN ratio reads back as `None`.

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureColumn, FeatureRow, FeatureSchema, FeatureTable, GroupKey, Grouping};
use crate::transactions::Transaction;

const DATE_FORMAT: &str = "%Y-%m-%d";
const KEY_COLUMNS: usize = 3;

pub trait TransactionSource {
    fn load_transactions(&self) -> Result<Vec<Transaction>, StoreError>;
}

pub trait FeatureSink {
    /// Replaces every row previously written for `anchor_day`. Returns rows written.
    fn write_features(&self, anchor_day: NaiveDate, table: &FeatureTable)
        -> Result<u64, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("schema registry payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid table name: {0}")]
    InvalidIdentifier(String),
    #[error("invalid stored date '{0}'")]
    InvalidDate(String),
    #[error("unknown grouping '{0}' in schema registry")]
    UnknownGrouping(String),
    #[error("feature table {0} has not been written yet")]
    UnknownFeatureTable(String),
    #[error("feature table {table} schema mismatch: registered {registered}, got {actual}")]
    SchemaMismatch {
        table: String,
        registered: String,
        actual: String,
    },
    #[error("feature row for household {household_key} has {found} values, schema has {expected}")]
    RowWidth {
        household_key: i64,
        found: usize,
        expected: usize,
    },
}

pub struct SqliteStore {
    conn: Connection,
    feature_table: String,
}

impl SqliteStore {
    pub fn open(path: &Path, feature_table: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, feature_table)?;

        info!(
            component = "store",
            event = "store.open",
            path = %path.display(),
            feature_table = %store.feature_table
        );

        Ok(store)
    }

    pub fn open_in_memory(feature_table: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, feature_table)
    }

    fn with_connection(conn: Connection, feature_table: &str) -> Result<Self, StoreError> {
        validate_identifier(feature_table)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS transactions_adj (
                household_key INTEGER NOT NULL,
                basket_id INTEGER NOT NULL,
                week_no INTEGER NOT NULL,
                day TEXT NOT NULL,
                trans_time INTEGER NOT NULL,
                store_id INTEGER NOT NULL,
                product_id INTEGER NOT NULL,
                commodity_desc TEXT NOT NULL,
                amount_list REAL NOT NULL,
                campaign_coupon_discount REAL NOT NULL,
                manuf_coupon_discount REAL NOT NULL,
                manuf_coupon_match_discount REAL NOT NULL,
                total_coupon_discount REAL NOT NULL,
                instore_discount REAL NOT NULL,
                amount_paid REAL NOT NULL,
                units INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS feature_schemas (
                table_name TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                grouping TEXT NOT NULL,
                columns_json TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn,
            feature_table: feature_table.to_string(),
        })
    }

    pub fn feature_table(&self) -> &str {
        &self.feature_table
    }

    /// Replaces the whole adjusted transaction table.
    pub fn replace_transactions(&self, transactions: &[Transaction]) -> Result<u64, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM transactions_adj", [])?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO transactions_adj (
                    household_key,
                    basket_id,
                    week_no,
                    day,
                    trans_time,
                    store_id,
                    product_id,
                    commodity_desc,
                    amount_list,
                    campaign_coupon_discount,
                    manuf_coupon_discount,
                    manuf_coupon_match_discount,
                    total_coupon_discount,
                    instore_discount,
                    amount_paid,
                    units
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ",
            )?;
            for txn in transactions {
                stmt.execute(params![
                    txn.household_key,
                    txn.basket_id,
                    txn.week_no,
                    txn.day.format(DATE_FORMAT).to_string(),
                    txn.trans_time,
                    txn.store_id,
                    txn.product_id,
                    txn.commodity_desc,
                    txn.amount_list,
                    txn.campaign_coupon_discount,
                    txn.manuf_coupon_discount,
                    txn.manuf_coupon_match_discount,
                    txn.total_coupon_discount,
                    txn.instore_discount,
                    txn.amount_paid,
                    txn.units
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.transactions.replaced",
            rows = transactions.len()
        );

        Ok(transactions.len() as u64)
    }

    /// Drops the feature table and its registry entry. Returns whether it existed.
    pub fn drop_feature_table(&self) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = tx.execute(
            "DELETE FROM feature_schemas WHERE table_name = ?1",
            params![self.feature_table],
        )?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_identifier(&self.feature_table)
        ))?;
        tx.commit()?;

        info!(
            component = "store",
            event = "store.features.dropped",
            feature_table = %self.feature_table,
            existed = removed > 0
        );

        Ok(removed > 0)
    }

    pub fn registered_schema(&self) -> Result<Option<FeatureSchema>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT version, fingerprint, grouping, columns_json FROM feature_schemas WHERE table_name = ?1",
                params![self.feature_table],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((version, fingerprint, grouping, columns_json)) = row else {
            return Ok(None);
        };
        let grouping =
            Grouping::parse(&grouping).ok_or_else(|| StoreError::UnknownGrouping(grouping.clone()))?;
        let columns: Vec<FeatureColumn> = serde_json::from_str(&columns_json)?;

        Ok(Some(FeatureSchema {
            version,
            fingerprint,
            grouping,
            columns,
        }))
    }

    /// Anchor days with stored features, ascending.
    pub fn anchor_days(&self) -> Result<Vec<NaiveDate>, StoreError> {
        if self.registered_schema()?.is_none() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT anchor_day FROM {} ORDER BY anchor_day ASC",
            quote_identifier(&self.feature_table)
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            out.push(parse_date(&raw)?);
        }
        Ok(out)
    }

    pub fn read_features(&self, anchor_day: NaiveDate) -> Result<FeatureTable, StoreError> {
        let schema = self
            .registered_schema()?
            .ok_or_else(|| StoreError::UnknownFeatureTable(self.feature_table.clone()))?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT * FROM {} WHERE anchor_day = ?1 ORDER BY household_key ASC, commodity_desc ASC",
            quote_identifier(&self.feature_table)
        ))?;
        let mut rows = stmt.query(params![anchor_day.format(DATE_FORMAT).to_string()])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let household_key: i64 = row.get(1)?;
            let commodity_desc: Option<String> = row.get(2)?;
            let mut values = Vec::with_capacity(schema.columns.len());
            for idx in 0..schema.columns.len() {
                values.push(row.get::<_, Option<f64>>(KEY_COLUMNS + idx)?);
            }
            out.push(FeatureRow {
                key: GroupKey {
                    household_key,
                    commodity_desc,
                },
                values,
            });
        }

        Ok(FeatureTable { schema, rows: out })
    }

    fn ensure_feature_table(&self, schema: &FeatureSchema) -> Result<(), StoreError> {
        if let Some(registered) = self.registered_schema()? {
            if registered.fingerprint != schema.fingerprint {
                return Err(StoreError::SchemaMismatch {
                    table: self.feature_table.clone(),
                    registered: registered.fingerprint,
                    actual: schema.fingerprint.clone(),
                });
            }
            return Ok(());
        }

        let mut ddl = format!(
            "CREATE TABLE {} (\n    anchor_day TEXT NOT NULL,\n    household_key INTEGER NOT NULL,\n    commodity_desc TEXT",
            quote_identifier(&self.feature_table)
        );
        for column in &schema.columns {
            ddl.push_str(&format!(",\n    {} REAL", quote_identifier(&column.name)));
        }
        ddl.push_str("\n);\n");
        ddl.push_str(&format!(
            "CREATE INDEX {} ON {} (anchor_day);",
            quote_identifier(&format!("{}_anchor_day", self.feature_table)),
            quote_identifier(&self.feature_table)
        ));

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&ddl)?;
        tx.execute(
            "INSERT INTO feature_schemas (table_name, version, fingerprint, grouping, columns_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.feature_table,
                schema.version,
                schema.fingerprint,
                schema.grouping.as_str(),
                serde_json::to_string(&schema.columns)?
            ],
        )?;
        tx.commit()?;

        info!(
            component = "store",
            event = "store.features.created",
            feature_table = %self.feature_table,
            columns = schema.columns.len(),
            fingerprint = %schema.fingerprint
        );

        Ok(())
    }
}

impl TransactionSource for SqliteStore {
    fn load_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                household_key,
                basket_id,
                week_no,
                day,
                trans_time,
                store_id,
                product_id,
                commodity_desc,
                amount_list,
                campaign_coupon_discount,
                manuf_coupon_discount,
                manuf_coupon_match_discount,
                total_coupon_discount,
                instore_discount,
                amount_paid,
                units
            FROM transactions_adj
            ORDER BY rowid ASC
            ",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let day: String = row.get(3)?;
            out.push(Transaction {
                household_key: row.get(0)?,
                basket_id: row.get(1)?,
                week_no: row.get(2)?,
                day: parse_date(&day)?,
                trans_time: row.get(4)?,
                store_id: row.get(5)?,
                product_id: row.get(6)?,
                commodity_desc: row.get(7)?,
                amount_list: row.get(8)?,
                campaign_coupon_discount: row.get(9)?,
                manuf_coupon_discount: row.get(10)?,
                manuf_coupon_match_discount: row.get(11)?,
                total_coupon_discount: row.get(12)?,
                instore_discount: row.get(13)?,
                amount_paid: row.get(14)?,
                units: row.get(15)?,
            });
        }

        Ok(out)
    }
}

impl FeatureSink for SqliteStore {
    fn write_features(
        &self,
        anchor_day: NaiveDate,
        table: &FeatureTable,
    ) -> Result<u64, StoreError> {
        self.ensure_feature_table(&table.schema)?;

        let width = table.schema.columns.len();
        let anchor = anchor_day.format(DATE_FORMAT).to_string();
        let placeholders = (1..=KEY_COLUMNS + width)
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE anchor_day = ?1",
                quote_identifier(&self.feature_table)
            ),
            params![anchor],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} VALUES ({placeholders})",
                quote_identifier(&self.feature_table)
            ))?;
            for row in &table.rows {
                if row.values.len() != width {
                    return Err(StoreError::RowWidth {
                        household_key: row.key.household_key,
                        found: row.values.len(),
                        expected: width,
                    });
                }
                stmt.execute(params_from_iter(row_values(&anchor, row)))?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.features.written",
            feature_table = %self.feature_table,
            anchor_day = %anchor_day,
            rows = table.rows.len()
        );

        Ok(table.rows.len() as u64)
    }
}

fn row_values(anchor: &str, row: &FeatureRow) -> Vec<Value> {
    let mut values = Vec::with_capacity(KEY_COLUMNS + row.values.len());
    values.push(Value::Text(anchor.to_string()));
    values.push(Value::Integer(row.key.household_key));
    values.push(match &row.key.commodity_desc {
        Some(commodity) => Value::Text(commodity.clone()),
        None => Value::Null,
    });
    values.extend(row.values.iter().map(|value| match value {
        Some(v) => Value::Real(*v),
        None => Value::Null,
    }));
    values
}

fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| StoreError::InvalidDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_identifier("propensity_features").is_ok());
        assert!(validate_identifier("features_v2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2features").is_err());
        assert!(validate_identifier("features; DROP TABLE x").is_err());
    }

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_identifier("days_30d"), "\"days_30d\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn dropping_missing_feature_table_reports_false() {
        let store = SqliteStore::open_in_memory("propensity_features").unwrap();
        assert!(!store.drop_feature_table().unwrap());
        assert!(store.anchor_days().unwrap().is_empty());
    }
}
