use std::time::Instant;

use propensity::{
    init_logging, load_adjusted_transactions, log_app_finish, log_app_start, log_pipeline_config,
    logging_config_from_env, pipeline_config_from_env, SqliteStore,
};

const APP: &str = "prepare_transactions";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env()?;
    init_logging(&logging_cfg)?;
    log_app_start(APP, &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    log_pipeline_config(APP, &cfg);

    let transactions = load_adjusted_transactions(&cfg.data_dir, cfg.day_zero)?;
    let store = SqliteStore::open(&cfg.store_path, &cfg.feature_table)?;

    // Features built from the previous transaction set no longer apply.
    store.drop_feature_table()?;
    let rows = store.replace_transactions(&transactions)?;

    println!(
        "prepared {rows} transactions into {}",
        cfg.store_path.display()
    );
    log_app_finish(APP, started.elapsed().as_millis());

    Ok(())
}
