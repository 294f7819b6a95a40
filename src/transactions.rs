//! Transaction ingestion and adjustment.
//!
//! Raw line items carry sales value and negative discount amounts. Adjustment
//! reconstructs list pricing and splits coupon discounts into campaign and
//! manufacturer components, then attaches the product's commodity label.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, NaiveDate};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const TRANSACTIONS_FILE: &str = "transaction_data.csv";
pub const PRODUCTS_FILE: &str = "product.csv";

/// Line item after adjustment. Day numbers have been converted to dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub household_key: i64,
    pub basket_id: i64,
    pub product_id: i64,
    pub commodity_desc: String,
    pub day: NaiveDate,
    pub week_no: i64,
    pub store_id: i64,
    pub trans_time: i64,
    pub amount_list: f64,
    pub instore_discount: f64,
    pub campaign_coupon_discount: f64,
    pub manuf_coupon_discount: f64,
    pub manuf_coupon_match_discount: f64,
    pub total_coupon_discount: f64,
    pub amount_paid: f64,
    pub units: i64,
}

/// Line item as published in `transaction_data.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub household_key: i64,
    pub basket_id: i64,
    pub day_number: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub sales_value: Option<f64>,
    pub store_id: i64,
    pub retail_disc: Option<f64>,
    pub trans_time: i64,
    pub week_no: i64,
    pub coupon_disc: Option<f64>,
    pub coupon_match_disc: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetBounds {
    pub min_day: NaiveDate,
    pub max_day: NaiveDate,
}

impl DatasetBounds {
    pub fn span_days(&self) -> i64 {
        (self.max_day - self.min_day).num_days() + 1
    }
}

/// Product id to commodity label.
pub type ProductCatalog = HashMap<i64, String>;

#[derive(Debug, Error)]
pub enum TransactionLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path} is missing required column {column}")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("failed to parse field {field} value '{value}' on line {line}")]
    ParseField {
        field: &'static str,
        value: String,
        line: u64,
    },
    #[error("day number {day_number} cannot be converted to a date")]
    InvalidDay { day_number: i64 },
    #[error("product {product_id} in basket {basket_id} is not in the product catalog")]
    UnknownProduct { product_id: i64, basket_id: i64 },
}

pub fn dataset_bounds(transactions: &[Transaction]) -> Option<DatasetBounds> {
    let min_day = transactions.iter().map(|txn| txn.day).min()?;
    let max_day = transactions.iter().map(|txn| txn.day).max()?;
    Some(DatasetBounds { min_day, max_day })
}

/// Day 1 maps to `day_zero`, day n to `day_zero + (n - 1)`.
pub fn day_number_to_date(
    day_number: i64,
    day_zero: NaiveDate,
) -> Result<NaiveDate, TransactionLoadError> {
    day_number
        .checked_sub(1)
        .and_then(ChronoDuration::try_days)
        .and_then(|offset| day_zero.checked_add_signed(offset))
        .ok_or(TransactionLoadError::InvalidDay { day_number })
}

pub fn adjust_transaction(
    raw: &RawTransaction,
    commodity_desc: &str,
    day_zero: NaiveDate,
) -> Result<Transaction, TransactionLoadError> {
    let coupon_disc = raw.coupon_disc.unwrap_or(0.0);
    let coupon_match_disc = raw.coupon_match_disc.unwrap_or(0.0);

    // A missing component voids the whole reconstruction rather than being treated as zero.
    let amount_list = match (
        raw.sales_value,
        raw.retail_disc,
        raw.coupon_disc,
        raw.coupon_match_disc,
    ) {
        (Some(sales), Some(retail), Some(coupon), Some(coupon_match)) => {
            sales - retail - coupon - coupon_match
        }
        _ => 0.0,
    };

    let (campaign_coupon_discount, manuf_coupon_discount) = if coupon_match_disc == 0.0 {
        (0.0 - coupon_disc, 0.0)
    } else {
        (0.0, 0.0 - coupon_disc)
    };

    let total_coupon_discount = match (raw.coupon_disc, raw.coupon_match_disc) {
        (Some(coupon), Some(coupon_match)) => coupon_match - coupon,
        _ => 0.0,
    };

    Ok(Transaction {
        household_key: raw.household_key,
        basket_id: raw.basket_id,
        product_id: raw.product_id,
        commodity_desc: commodity_desc.to_string(),
        day: day_number_to_date(raw.day_number, day_zero)?,
        week_no: raw.week_no,
        store_id: raw.store_id,
        trans_time: raw.trans_time,
        amount_list,
        instore_discount: raw.retail_disc.map(|retail| 0.0 - retail).unwrap_or(0.0),
        campaign_coupon_discount,
        manuf_coupon_discount,
        manuf_coupon_match_discount: 0.0 - coupon_match_disc,
        total_coupon_discount,
        amount_paid: raw.sales_value.unwrap_or(0.0),
        units: raw.quantity,
    })
}

pub fn adjust_transactions(
    raw: &[RawTransaction],
    catalog: &ProductCatalog,
    day_zero: NaiveDate,
) -> Result<Vec<Transaction>, TransactionLoadError> {
    raw.iter()
        .map(|row| {
            let commodity = catalog.get(&row.product_id).ok_or(
                TransactionLoadError::UnknownProduct {
                    product_id: row.product_id,
                    basket_id: row.basket_id,
                },
            )?;
            adjust_transaction(row, commodity, day_zero)
        })
        .collect()
}

pub fn load_product_catalog(path: &Path) -> Result<ProductCatalog, TransactionLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = HeaderIndex::new(path, reader.headers()?);
    let product_idx = headers.require("product_id")?;
    let commodity_idx = headers.require("commodity_desc")?;

    let mut catalog = ProductCatalog::new();
    for record in reader.records() {
        let record = record?;
        let product_id = parse_i64(&record, product_idx, "product_id")?;
        let commodity = record.get(commodity_idx).unwrap_or_default().to_string();
        catalog.insert(product_id, commodity);
    }

    debug!(
        component = "transactions",
        event = "transactions.catalog.loaded",
        path = %path.display(),
        products = catalog.len()
    );

    Ok(catalog)
}

pub fn load_raw_transactions(path: &Path) -> Result<Vec<RawTransaction>, TransactionLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = HeaderIndex::new(path, reader.headers()?);
    let columns = RawColumns {
        household_key: headers.require("household_key")?,
        basket_id: headers.require("basket_id")?,
        day: headers.require("day")?,
        product_id: headers.require("product_id")?,
        quantity: headers.require("quantity")?,
        sales_value: headers.require("sales_value")?,
        store_id: headers.require("store_id")?,
        retail_disc: headers.require("retail_disc")?,
        trans_time: headers.require("trans_time")?,
        week_no: headers.require("week_no")?,
        coupon_disc: headers.require("coupon_disc")?,
        coupon_match_disc: headers.require("coupon_match_disc")?,
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(parse_raw_record(&record, &columns)?);
    }

    Ok(rows)
}

/// Reads both raw files from `data_dir` and returns adjusted transactions.
pub fn load_adjusted_transactions(
    data_dir: &Path,
    day_zero: NaiveDate,
) -> Result<Vec<Transaction>, TransactionLoadError> {
    let transactions_path = data_dir.join(TRANSACTIONS_FILE);
    let products_path = data_dir.join(PRODUCTS_FILE);

    info!(
        component = "transactions",
        event = "transactions.load.start",
        transactions_path = %transactions_path.display(),
        products_path = %products_path.display(),
        day_zero = %day_zero
    );

    let catalog = load_product_catalog(&products_path)?;
    let raw = load_raw_transactions(&transactions_path)?;
    let adjusted = adjust_transactions(&raw, &catalog, day_zero)?;

    match dataset_bounds(&adjusted) {
        Some(bounds) => info!(
            component = "transactions",
            event = "transactions.load.finish",
            rows = adjusted.len(),
            min_day = %bounds.min_day,
            max_day = %bounds.max_day,
            span_days = bounds.span_days()
        ),
        None => info!(
            component = "transactions",
            event = "transactions.load.finish",
            rows = 0
        ),
    }

    Ok(adjusted)
}

struct RawColumns {
    household_key: usize,
    basket_id: usize,
    day: usize,
    product_id: usize,
    quantity: usize,
    sales_value: usize,
    store_id: usize,
    retail_disc: usize,
    trans_time: usize,
    week_no: usize,
    coupon_disc: usize,
    coupon_match_disc: usize,
}

/// Case-insensitive header lookup; the published files mix upper and lower case.
struct HeaderIndex<'a> {
    path: &'a Path,
    names: Vec<String>,
}

impl<'a> HeaderIndex<'a> {
    fn new(path: &'a Path, headers: &StringRecord) -> Self {
        Self {
            path,
            names: headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }

    fn require(&self, column: &'static str) -> Result<usize, TransactionLoadError> {
        self.names
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| TransactionLoadError::MissingColumn {
                path: self.path.to_path_buf(),
                column,
            })
    }
}

fn parse_raw_record(
    record: &StringRecord,
    columns: &RawColumns,
) -> Result<RawTransaction, TransactionLoadError> {
    Ok(RawTransaction {
        household_key: parse_i64(record, columns.household_key, "household_key")?,
        basket_id: parse_i64(record, columns.basket_id, "basket_id")?,
        day_number: parse_i64(record, columns.day, "day")?,
        product_id: parse_i64(record, columns.product_id, "product_id")?,
        quantity: parse_i64(record, columns.quantity, "quantity")?,
        sales_value: parse_opt_f64(record, columns.sales_value, "sales_value")?,
        store_id: parse_i64(record, columns.store_id, "store_id")?,
        retail_disc: parse_opt_f64(record, columns.retail_disc, "retail_disc")?,
        trans_time: parse_i64(record, columns.trans_time, "trans_time")?,
        week_no: parse_i64(record, columns.week_no, "week_no")?,
        coupon_disc: parse_opt_f64(record, columns.coupon_disc, "coupon_disc")?,
        coupon_match_disc: parse_opt_f64(record, columns.coupon_match_disc, "coupon_match_disc")?,
    })
}

fn record_line(record: &StringRecord) -> u64 {
    record.position().map(|pos| pos.line()).unwrap_or(0)
}

fn parse_i64(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<i64, TransactionLoadError> {
    let raw = record.get(idx).unwrap_or_default();
    raw.parse::<i64>()
        .map_err(|_| TransactionLoadError::ParseField {
            field,
            value: raw.to_string(),
            line: record_line(record),
        })
}

fn parse_opt_f64(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<Option<f64>, TransactionLoadError> {
    let raw = record.get(idx).unwrap_or_default();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| TransactionLoadError::ParseField {
            field,
            value: raw.to_string(),
            line: record_line(record),
        })
}
