//! Propensity feature core crate.
//!
//! Current implemented scope:
//! - transaction ingestion and list-price/coupon adjustment
//! - window resolution (30d, 60d, 90d and the 1yr anniversary window)
//! - per-household and per-household+category window features
//! - per-anchor-day feature sets persisted to SQLite

mod config;
mod feature_set;
mod features;
mod observability;
mod pipeline;
mod store;
mod transactions;
mod window;

pub use config::{
    pipeline_config_from_env, ConfigError, PipelineConfig, ENV_ANCHOR_DAYS, ENV_DATA_DIR,
    ENV_DAY_ZERO, ENV_FEATURE_TABLE, ENV_RECENCY, ENV_STORE_PATH, ENV_WINDOWS,
};
pub use feature_set::{assemble_feature_set, merge_feature_tables, FeatureSetError};
pub use features::{
    assert_schema_compatible, build_feature_schema, compute_features, compute_features_for_token,
    compute_features_with, feature_column_name, metric_names, DiscountKind, FeatureColumn,
    FeatureDType, FeatureError, FeatureOptions, FeatureRow, FeatureSchema, FeatureTable, GroupKey,
    Grouping, RecencySentinel, ALL_DISCOUNTS, FEATURE_SCHEMA_VERSION,
};
pub use observability::{
    env_filter, init_logging, log_app_finish, log_app_start, log_pipeline_config,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError, ENV_LOG_FORMAT, ENV_LOG_LEVEL, ENV_LOG_TARGET,
};
pub use pipeline::{
    anchor_days, build_feature_set, run_feature_pipeline, snapshot, AnchorReport, PipelineError,
    PipelineReport,
};
pub use store::{FeatureSink, SqliteStore, StoreError, TransactionSource};
pub use transactions::{
    adjust_transaction, adjust_transactions, dataset_bounds, day_number_to_date,
    load_adjusted_transactions, load_product_catalog, load_raw_transactions, DatasetBounds,
    ProductCatalog, RawTransaction, Transaction, TransactionLoadError, PRODUCTS_FILE,
    TRANSACTIONS_FILE,
};
pub use window::{
    parse_window, parse_window_list, WindowError, WindowKind, WindowRange, ALL_WINDOWS,
};
