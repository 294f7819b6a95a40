//! Window feature aggregation over the adjusted transaction log.
//!
//! One call produces one table for a (grouping, window) pair:
//! - anchor keys are every household (or household+commodity) seen in the input
//! - summary counts and sums cover the window only
//! - ratios are expanded from a static table over the summary values
//! - `days_since_*` recency looks back over all history up to the window end
//!
//! Keys without activity keep their row with `None` metrics. Ratios are not
//! guarded against zero denominators and may be NaN or infinite.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::transactions::{dataset_bounds, Transaction};
use crate::window::{parse_window, WindowError, WindowKind, WindowRange};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

const CATEGORY_SUFFIX: &str = "_cmd";
const SUMMARY_WIDTH: usize = 26;
const DISCOUNT_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grouping {
    Household,
    HouseholdCategory,
}

impl Grouping {
    pub fn from_flag(group_by_category: bool) -> Self {
        if group_by_category {
            Self::HouseholdCategory
        } else {
            Self::Household
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Household => "household",
            Self::HouseholdCategory => "household_category",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "household" => Some(Self::Household),
            "household_category" => Some(Self::HouseholdCategory),
            _ => None,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Household => "",
            Self::HouseholdCategory => CATEGORY_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub household_key: i64,
    pub commodity_desc: Option<String>,
}

impl GroupKey {
    pub fn household(household_key: i64) -> Self {
        Self {
            household_key,
            commodity_desc: None,
        }
    }

    pub fn household_category(household_key: i64, commodity_desc: impl Into<String>) -> Self {
        Self {
            household_key,
            commodity_desc: Some(commodity_desc.into()),
        }
    }

    fn for_transaction(txn: &Transaction, grouping: Grouping) -> Self {
        match grouping {
            Grouping::Household => Self::household(txn.household_key),
            Grouping::HouseholdCategory => {
                Self::household_category(txn.household_key, txn.commodity_desc.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscountKind {
    Instore,
    CampaignCoupon,
    ManufCoupon,
    TotalCoupon,
}

pub const ALL_DISCOUNTS: [DiscountKind; DISCOUNT_COUNT] = [
    DiscountKind::Instore,
    DiscountKind::CampaignCoupon,
    DiscountKind::ManufCoupon,
    DiscountKind::TotalCoupon,
];

impl DiscountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instore => "instore_discount",
            Self::CampaignCoupon => "campaign_coupon_discount",
            Self::ManufCoupon => "manuf_coupon_discount",
            Self::TotalCoupon => "total_coupon_discount",
        }
    }

    pub fn amount(self, txn: &Transaction) -> f64 {
        match self {
            Self::Instore => txn.instore_discount,
            Self::CampaignCoupon => txn.campaign_coupon_discount,
            Self::ManufCoupon => txn.manuf_coupon_discount,
            Self::TotalCoupon => txn.total_coupon_discount,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Instore => 0,
            Self::CampaignCoupon => 1,
            Self::ManufCoupon => 2,
            Self::TotalCoupon => 3,
        }
    }
}

/// What `days_since_*` reports when a discount type never occurred in the lookback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecencySentinel {
    /// Non-discount rows contribute `end - window start`, so keys without the
    /// discount read the window span and older occurrences are capped at it.
    WindowSpan,
    /// Days since the most recent discounted line item, `None` when there is none.
    NeverObserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOptions {
    pub recency: RecencySentinel,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            recency: RecencySentinel::WindowSpan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub grouping: Grouping,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn from_columns(version: u32, grouping: Grouping, columns: Vec<FeatureColumn>) -> Self {
        let fingerprint = schema_fingerprint(version, grouping, &columns);
        Self {
            version,
            fingerprint,
            grouping,
            columns,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

/// One output row. `None` marks a metric that is undefined for this key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: GroupKey,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn grouping(&self) -> Grouping {
        self.schema.grouping
    }

    pub fn row(&self, key: &GroupKey) -> Option<&FeatureRow> {
        self.rows
            .binary_search_by(|row| row.key.cmp(key))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    /// Value of `column` for `key`; `None` when the key, the column or the value is absent.
    pub fn value(&self, key: &GroupKey, column: &str) -> Option<f64> {
        let idx = self.schema.column_index(column)?;
        self.row(key)?.values.get(idx).copied().flatten()
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("transaction set is empty; dataset bounds are undefined")]
    EmptyDataset,
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Amount {
    List,
    Discount(DiscountKind),
    Paid,
}

impl Amount {
    fn index(self) -> usize {
        match self {
            Self::List => 0,
            Self::Discount(kind) => 1 + kind.index(),
            Self::Paid => 5,
        }
    }
}

/// Windowed summary value; its index is its position in the output columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Measure {
    Days,
    Baskets,
    Products,
    LineItems,
    Sum(Amount),
    DaysWith(DiscountKind),
    BasketsWith(DiscountKind),
    ProductsWith(DiscountKind),
    /// Count of discounted line items. An active key without the discount
    /// reads 0.0 here; a Spark `sum(case when .. then 1 end)` would read null.
    LineItemsWith(DiscountKind),
}

impl Measure {
    fn index(self) -> usize {
        match self {
            Self::Days => 0,
            Self::Baskets => 1,
            Self::Products => 2,
            Self::LineItems => 3,
            Self::Sum(amount) => 4 + amount.index(),
            Self::DaysWith(kind) => 10 + kind.index(),
            Self::BasketsWith(kind) => 14 + kind.index(),
            Self::ProductsWith(kind) => 18 + kind.index(),
            Self::LineItemsWith(kind) => 22 + kind.index(),
        }
    }

    fn name(self) -> String {
        match self {
            Self::Days => "days".to_string(),
            Self::Baskets => "baskets".to_string(),
            Self::Products => "products".to_string(),
            Self::LineItems => "line_items".to_string(),
            Self::Sum(Amount::List) => "amount_list".to_string(),
            Self::Sum(Amount::Discount(kind)) => kind.as_str().to_string(),
            Self::Sum(Amount::Paid) => "amount_paid".to_string(),
            Self::DaysWith(kind) => format!("days_with_{}", kind.as_str()),
            Self::BasketsWith(kind) => format!("baskets_with_{}", kind.as_str()),
            Self::ProductsWith(kind) => format!("products_with_{}", kind.as_str()),
            Self::LineItemsWith(kind) => format!("line_items_with_{}", kind.as_str()),
        }
    }
}

use Amount as A;
use DiscountKind as D;
use Measure as M;

const SUMMARY_MEASURES: [Measure; SUMMARY_WIDTH] = [
    M::Days,
    M::Baskets,
    M::Products,
    M::LineItems,
    M::Sum(A::List),
    M::Sum(A::Discount(D::Instore)),
    M::Sum(A::Discount(D::CampaignCoupon)),
    M::Sum(A::Discount(D::ManufCoupon)),
    M::Sum(A::Discount(D::TotalCoupon)),
    M::Sum(A::Paid),
    M::DaysWith(D::Instore),
    M::DaysWith(D::CampaignCoupon),
    M::DaysWith(D::ManufCoupon),
    M::DaysWith(D::TotalCoupon),
    M::BasketsWith(D::Instore),
    M::BasketsWith(D::CampaignCoupon),
    M::BasketsWith(D::ManufCoupon),
    M::BasketsWith(D::TotalCoupon),
    M::ProductsWith(D::Instore),
    M::ProductsWith(D::CampaignCoupon),
    M::ProductsWith(D::ManufCoupon),
    M::ProductsWith(D::TotalCoupon),
    M::LineItemsWith(D::Instore),
    M::LineItemsWith(D::CampaignCoupon),
    M::LineItemsWith(D::ManufCoupon),
    M::LineItemsWith(D::TotalCoupon),
];

#[derive(Debug, Clone, Copy)]
enum Divisor {
    Measure(Measure),
    DaysInWindow,
}

#[derive(Debug, Clone, Copy)]
struct Ratio {
    name: &'static str,
    numerator: Measure,
    divisor: Divisor,
}

const fn ratio(name: &'static str, numerator: Measure, divisor: Divisor) -> Ratio {
    Ratio {
        name,
        numerator,
        divisor,
    }
}

const PER_DAY: Divisor = Divisor::Measure(M::Days);
const PER_WINDOW_DAY: Divisor = Divisor::DaysInWindow;
const PER_BASKET: Divisor = Divisor::Measure(M::Baskets);
const PER_PRODUCT: Divisor = Divisor::Measure(M::Products);
const PER_LINE_ITEM: Divisor = Divisor::Measure(M::LineItems);
const PER_AMOUNT_LIST: Divisor = Divisor::Measure(M::Sum(A::List));

#[rustfmt::skip]
const RATIOS: &[Ratio] = &[
    ratio("baskets_per_day", M::Baskets, PER_DAY),
    ratio("products_per_day", M::Products, PER_DAY),
    ratio("line_items_per_day", M::LineItems, PER_DAY),
    ratio("amount_list_per_day", M::Sum(A::List), PER_DAY),
    ratio("instore_discount_per_day", M::Sum(A::Discount(D::Instore)), PER_DAY),
    ratio("campaign_coupon_discount_per_day", M::Sum(A::Discount(D::CampaignCoupon)), PER_DAY),
    ratio("manuf_coupon_discount_per_day", M::Sum(A::Discount(D::ManufCoupon)), PER_DAY),
    ratio("total_coupon_discount_per_day", M::Sum(A::Discount(D::TotalCoupon)), PER_DAY),
    ratio("amount_paid_per_day", M::Sum(A::Paid), PER_DAY),
    ratio("days_with_instore_discount_per_days", M::DaysWith(D::Instore), PER_DAY),
    ratio("days_with_campaign_coupon_discount_per_days", M::DaysWith(D::CampaignCoupon), PER_DAY),
    ratio("days_with_manuf_coupon_discount_per_days", M::DaysWith(D::ManufCoupon), PER_DAY),
    ratio("days_with_total_coupon_discount_per_days", M::DaysWith(D::TotalCoupon), PER_DAY),

    ratio("days_to_days_in_set", M::Days, PER_WINDOW_DAY),
    ratio("baskets_per_days_in_set", M::Baskets, PER_WINDOW_DAY),
    ratio("products_to_days_in_set", M::Products, PER_WINDOW_DAY),
    ratio("line_items_per_days_in_set", M::LineItems, PER_WINDOW_DAY),
    ratio("amount_list_per_days_in_set", M::Sum(A::List), PER_WINDOW_DAY),
    ratio("instore_discount_per_days_in_set", M::Sum(A::Discount(D::Instore)), PER_WINDOW_DAY),
    ratio("campaign_coupon_discount_per_days_in_set", M::Sum(A::Discount(D::CampaignCoupon)), PER_WINDOW_DAY),
    ratio("manuf_coupon_discount_per_days_in_set", M::Sum(A::Discount(D::ManufCoupon)), PER_WINDOW_DAY),
    ratio("total_coupon_discount_per_days_in_set", M::Sum(A::Discount(D::TotalCoupon)), PER_WINDOW_DAY),
    ratio("amount_paid_per_days_in_set", M::Sum(A::Paid), PER_WINDOW_DAY),
    ratio("days_with_instore_discount_per_days_in_set", M::DaysWith(D::Instore), PER_WINDOW_DAY),
    ratio("days_with_campaign_coupon_discount_per_days_in_set", M::DaysWith(D::CampaignCoupon), PER_WINDOW_DAY),
    ratio("days_with_manuf_coupon_discount_per_days_in_set", M::DaysWith(D::ManufCoupon), PER_WINDOW_DAY),
    ratio("days_with_total_coupon_discount_per_days_in_set", M::DaysWith(D::TotalCoupon), PER_WINDOW_DAY),

    ratio("products_per_basket", M::Products, PER_BASKET),
    ratio("line_items_per_basket", M::LineItems, PER_BASKET),
    ratio("amount_list_per_basket", M::Sum(A::List), PER_BASKET),
    ratio("instore_discount_per_basket", M::Sum(A::Discount(D::Instore)), PER_BASKET),
    ratio("campaign_coupon_discount_per_basket", M::Sum(A::Discount(D::CampaignCoupon)), PER_BASKET),
    ratio("manuf_coupon_discount_per_basket", M::Sum(A::Discount(D::ManufCoupon)), PER_BASKET),
    ratio("total_coupon_discount_per_basket", M::Sum(A::Discount(D::TotalCoupon)), PER_BASKET),
    ratio("amount_paid_per_basket", M::Sum(A::Paid), PER_BASKET),
    ratio("baskets_with_instore_discount_per_baskets", M::BasketsWith(D::Instore), PER_BASKET),
    ratio("baskets_with_campaign_coupon_discount_per_baskets", M::BasketsWith(D::CampaignCoupon), PER_BASKET),
    ratio("baskets_with_manuf_coupon_discount_per_baskets", M::BasketsWith(D::ManufCoupon), PER_BASKET),
    ratio("baskets_with_total_coupon_discount_per_baskets", M::BasketsWith(D::TotalCoupon), PER_BASKET),

    ratio("line_items_per_product", M::LineItems, PER_PRODUCT),
    ratio("amount_list_per_product", M::Sum(A::List), PER_PRODUCT),
    ratio("instore_discount_per_product", M::Sum(A::Discount(D::Instore)), PER_PRODUCT),
    ratio("campaign_coupon_discount_per_product", M::Sum(A::Discount(D::CampaignCoupon)), PER_PRODUCT),
    ratio("manuf_coupon_discount_per_product", M::Sum(A::Discount(D::ManufCoupon)), PER_PRODUCT),
    ratio("total_coupon_discount_per_product", M::Sum(A::Discount(D::TotalCoupon)), PER_PRODUCT),
    ratio("amount_paid_per_product", M::Sum(A::Paid), PER_PRODUCT),
    ratio("products_with_instore_discount_per_product", M::ProductsWith(D::Instore), PER_PRODUCT),
    ratio("products_with_campaign_coupon_discount_per_product", M::ProductsWith(D::CampaignCoupon), PER_PRODUCT),
    ratio("products_with_manuf_coupon_discount_per_product", M::ProductsWith(D::ManufCoupon), PER_PRODUCT),
    ratio("products_with_total_coupon_discount_per_product", M::ProductsWith(D::TotalCoupon), PER_PRODUCT),

    ratio("amount_list_per_line_item", M::Sum(A::List), PER_LINE_ITEM),
    ratio("instore_discount_per_line_item", M::Sum(A::Discount(D::Instore)), PER_LINE_ITEM),
    ratio("campaign_coupon_discount_per_line_item", M::Sum(A::Discount(D::CampaignCoupon)), PER_LINE_ITEM),
    ratio("manuf_coupon_discount_per_line_item", M::Sum(A::Discount(D::ManufCoupon)), PER_LINE_ITEM),
    ratio("total_coupon_discount_per_line_item", M::Sum(A::Discount(D::TotalCoupon)), PER_LINE_ITEM),
    ratio("amount_paid_per_line_item", M::Sum(A::Paid), PER_LINE_ITEM),
    ratio("products_with_instore_discount_per_line_item", M::ProductsWith(D::Instore), PER_LINE_ITEM),
    ratio("products_with_campaign_coupon_discount_per_line_item", M::ProductsWith(D::CampaignCoupon), PER_LINE_ITEM),
    ratio("products_with_manuf_coupon_discount_per_line_item", M::ProductsWith(D::ManufCoupon), PER_LINE_ITEM),
    ratio("products_with_total_coupon_discount_per_line_item", M::ProductsWith(D::TotalCoupon), PER_LINE_ITEM),

    ratio("campaign_coupon_discount_to_amount_list", M::Sum(A::Discount(D::CampaignCoupon)), PER_AMOUNT_LIST),
    ratio("manuf_coupon_discount_to_amount_list", M::Sum(A::Discount(D::ManufCoupon)), PER_AMOUNT_LIST),
    ratio("total_coupon_discount_to_amount_list", M::Sum(A::Discount(D::TotalCoupon)), PER_AMOUNT_LIST),
    ratio("amount_paid_to_amount_list", M::Sum(A::Paid), PER_AMOUNT_LIST),
];

impl Ratio {
    fn evaluate(&self, summary: &[f64; SUMMARY_WIDTH], days_in_window: f64) -> f64 {
        let numerator = summary[self.numerator.index()];
        let denominator = match self.divisor {
            Divisor::Measure(measure) => summary[measure.index()],
            Divisor::DaysInWindow => days_in_window,
        };
        numerator / denominator
    }
}

#[derive(Debug, Default)]
struct DiscountActivity {
    days: HashSet<NaiveDate>,
    baskets: HashSet<i64>,
    products: HashSet<i64>,
    line_items: u64,
}

#[derive(Debug, Default)]
struct WindowSummary {
    days: HashSet<NaiveDate>,
    baskets: HashSet<i64>,
    products: u64,
    line_items: u64,
    sums: [f64; 6],
    discounts: [DiscountActivity; DISCOUNT_COUNT],
}

impl WindowSummary {
    fn observe(&mut self, txn: &Transaction) {
        self.days.insert(txn.day);
        self.baskets.insert(txn.basket_id);
        self.products += 1;
        self.line_items += 1;

        self.sums[A::List.index()] += txn.amount_list;
        self.sums[A::Paid.index()] += txn.amount_paid;
        for kind in ALL_DISCOUNTS {
            let amount = kind.amount(txn);
            self.sums[A::Discount(kind).index()] += amount;
            if amount > 0.0 {
                let activity = &mut self.discounts[kind.index()];
                activity.days.insert(txn.day);
                activity.baskets.insert(txn.basket_id);
                activity.products.insert(txn.product_id);
                activity.line_items += 1;
            }
        }
    }

    fn values(&self) -> [f64; SUMMARY_WIDTH] {
        let mut out = [0.0; SUMMARY_WIDTH];
        out[M::Days.index()] = self.days.len() as f64;
        out[M::Baskets.index()] = self.baskets.len() as f64;
        out[M::Products.index()] = self.products as f64;
        out[M::LineItems.index()] = self.line_items as f64;
        for (idx, sum) in self.sums.iter().enumerate() {
            out[M::Sum(A::List).index() + idx] = *sum;
        }
        for kind in ALL_DISCOUNTS {
            let activity = &self.discounts[kind.index()];
            out[M::DaysWith(kind).index()] = activity.days.len() as f64;
            out[M::BasketsWith(kind).index()] = activity.baskets.len() as f64;
            out[M::ProductsWith(kind).index()] = activity.products.len() as f64;
            out[M::LineItemsWith(kind).index()] = activity.line_items as f64;
        }
        out
    }
}

#[derive(Debug, Default)]
struct Recency {
    days_since: [Option<i64>; DISCOUNT_COUNT],
}

impl Recency {
    fn observe(&mut self, txn: &Transaction, range: &WindowRange, sentinel: RecencySentinel) {
        for kind in ALL_DISCOUNTS {
            let discounted = kind.amount(txn) > 0.0;
            let reference = match (discounted, sentinel) {
                (true, _) => txn.day,
                (false, RecencySentinel::WindowSpan) => range.start,
                (false, RecencySentinel::NeverObserved) => continue,
            };
            let candidate = (range.end - reference).num_days();
            let slot = &mut self.days_since[kind.index()];
            *slot = Some(slot.map_or(candidate, |current| current.min(candidate)));
        }
    }
}

/// Base metric names in output order, before suffixing.
pub fn metric_names() -> Vec<String> {
    let mut names: Vec<String> = SUMMARY_MEASURES.iter().map(|m| m.name()).collect();
    names.extend(RATIOS.iter().map(|r| r.name.to_string()));
    names.extend(
        ALL_DISCOUNTS
            .iter()
            .map(|kind| format!("days_since_{}", kind.as_str())),
    );
    names
}

pub fn feature_column_name(metric: &str, grouping: Grouping, window: WindowKind) -> String {
    format!("{metric}{}{}", grouping.suffix(), window.suffix())
}

pub fn build_feature_schema(grouping: Grouping, window: WindowKind) -> FeatureSchema {
    let columns: Vec<FeatureColumn> = metric_names()
        .iter()
        .map(|metric| FeatureColumn {
            name: feature_column_name(metric, grouping, window),
            dtype: FeatureDType::F64,
        })
        .collect();
    let schema = FeatureSchema::from_columns(FEATURE_SCHEMA_VERSION, grouping, columns);

    debug!(
        component = "features",
        event = "features.schema.built",
        version = schema.version,
        grouping = grouping.as_str(),
        window = window.token(),
        column_count = schema.columns.len(),
        fingerprint = %schema.fingerprint
    );

    schema
}

pub fn compute_features(
    transactions: &[Transaction],
    group_by_category: bool,
    window: WindowKind,
) -> Result<FeatureTable, FeatureError> {
    compute_features_with(
        transactions,
        group_by_category,
        window,
        &FeatureOptions::default(),
    )
}

/// Parses `window_token` before touching the data, so unknown windows fail fast.
pub fn compute_features_for_token(
    transactions: &[Transaction],
    group_by_category: bool,
    window_token: &str,
) -> Result<FeatureTable, FeatureError> {
    let window = parse_window(window_token)?;
    compute_features(transactions, group_by_category, window)
}

pub fn compute_features_with(
    transactions: &[Transaction],
    group_by_category: bool,
    window: WindowKind,
    options: &FeatureOptions,
) -> Result<FeatureTable, FeatureError> {
    let grouping = Grouping::from_flag(group_by_category);
    let bounds = dataset_bounds(transactions).ok_or(FeatureError::EmptyDataset)?;
    let range = window.resolve(bounds.max_day)?;
    let days_in_window = range.days_in_window() as f64;

    info!(
        component = "features",
        event = "features.compute.start",
        window = window.token(),
        grouping = grouping.as_str(),
        transactions = transactions.len(),
        min_day = %bounds.min_day,
        max_day = %bounds.max_day,
        window_start = %range.start,
        window_end = %range.end,
        days_in_window = range.days_in_window(),
        recency = ?options.recency
    );

    let anchor_keys: BTreeSet<GroupKey> = transactions
        .iter()
        .map(|txn| GroupKey::for_transaction(txn, grouping))
        .collect();

    let mut summaries: HashMap<GroupKey, WindowSummary> = HashMap::new();
    let mut recencies: HashMap<GroupKey, Recency> = HashMap::new();
    for txn in transactions {
        if txn.day > range.end {
            continue;
        }
        let key = GroupKey::for_transaction(txn, grouping);
        if range.contains(txn.day) {
            summaries.entry(key.clone()).or_default().observe(txn);
        }
        recencies
            .entry(key)
            .or_default()
            .observe(txn, &range, options.recency);
    }

    let schema = build_feature_schema(grouping, window);
    let width = schema.columns.len();
    let mut non_finite_cells = 0usize;

    let rows: Vec<FeatureRow> = anchor_keys
        .into_iter()
        .map(|key| {
            let mut values = Vec::with_capacity(width);
            match summaries.get(&key) {
                Some(summary) => {
                    let summary = summary.values();
                    values.extend(summary.iter().map(|v| Some(*v)));
                    for ratio in RATIOS {
                        let value = ratio.evaluate(&summary, days_in_window);
                        if !value.is_finite() {
                            non_finite_cells += 1;
                        }
                        values.push(Some(value));
                    }
                }
                None => values.resize(SUMMARY_WIDTH + RATIOS.len(), None),
            }
            match recencies.get(&key) {
                Some(recency) => {
                    values.extend(recency.days_since.iter().map(|d| d.map(|d| d as f64)))
                }
                None => values.extend([None; DISCOUNT_COUNT]),
            }
            FeatureRow { key, values }
        })
        .collect();

    if non_finite_cells > 0 {
        debug!(
            component = "features",
            event = "features.compute.non_finite",
            window = window.token(),
            grouping = grouping.as_str(),
            cells = non_finite_cells
        );
    }

    info!(
        component = "features",
        event = "features.compute.finish",
        window = window.token(),
        grouping = grouping.as_str(),
        rows = rows.len(),
        active_keys = summaries.len(),
        idle_keys = rows.len() - summaries.len(),
        columns = width
    );

    Ok(FeatureTable { schema, rows })
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(version: u32, grouping: Grouping, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("grouping:{};", grouping.as_str()));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_measures_are_laid_out_by_index() {
        for (idx, measure) in SUMMARY_MEASURES.iter().enumerate() {
            assert_eq!(measure.index(), idx, "{}", measure.name());
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let names = metric_names();
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(names.len(), SUMMARY_WIDTH + RATIOS.len() + DISCOUNT_COUNT);
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn ratio_division_by_zero_is_not_masked() {
        let mut summary = [0.0; SUMMARY_WIDTH];
        summary[M::Sum(A::Paid).index()] = 3.0;
        let paid_to_list = RATIOS
            .iter()
            .find(|r| r.name == "amount_paid_to_amount_list")
            .unwrap();
        let campaign_to_list = RATIOS
            .iter()
            .find(|r| r.name == "campaign_coupon_discount_to_amount_list")
            .unwrap();

        assert_eq!(paid_to_list.evaluate(&summary, 30.0), f64::INFINITY);
        assert!(campaign_to_list.evaluate(&summary, 30.0).is_nan());
    }

    #[test]
    fn category_suffix_precedes_window_suffix() {
        assert_eq!(
            feature_column_name("baskets", Grouping::HouseholdCategory, WindowKind::Last90Days),
            "baskets_cmd_90d"
        );
        assert_eq!(
            feature_column_name("baskets", Grouping::Household, WindowKind::Anniversary30Days),
            "baskets_1yr"
        );
    }
}
