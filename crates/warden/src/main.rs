use std::sync::Arc;

use warden_core::config::Config;
use warden_store::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), warden_core::Error> {
    warden_core::logging::init("warden")?;

    let cfg = Arc::new(Config::load()?);
    println!("warden: ledger at {}", cfg.database_path.display());

    let store = Arc::new(SqliteStore::open(&cfg.database_path)?);

    warden_telegram::router::run_polling(cfg, store)
        .await
        .map_err(|e| warden_core::Error::Transport(format!("telegram bot failed: {e}")))?;

    Ok(())
}
