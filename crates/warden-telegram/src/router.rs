//! Update routing and shared bot state.

use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use warden_core::{
    audit::AuditLogger,
    config::Config,
    engine::{ComplianceTimerEngine, TimerPolicy},
};
use warden_store::SqliteStore;

use crate::handlers;
use crate::TelegramNotifier;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub engine: ComplianceTimerEngine,
    pub store: Arc<SqliteStore>,
    pub notifier: TelegramNotifier,
    pub audit: Arc<AuditLogger>,
}

pub async fn run_polling(cfg: Arc<Config>, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    // Basic startup info.
    if let Ok(me) = bot.get_me().await {
        println!("warden started: @{}", me.username());
    }

    let audit = Arc::new(AuditLogger::new(
        cfg.audit_log_path.clone(),
        cfg.audit_log_json,
    ));

    let notifier = TelegramNotifier::new(bot.clone(), cfg.clone(), audit.clone());

    let engine = ComplianceTimerEngine::new(
        TimerPolicy {
            window: cfg.window,
            warning_offset: cfg.warning_offset,
        },
        store.clone(),
        Arc::new(notifier.clone()),
    );

    let state = Arc::new(AppState {
        cfg,
        engine,
        store,
        notifier,
        audit,
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .build()
        .dispatch()
        .await;

    state.engine.shutdown().await;

    Ok(())
}
