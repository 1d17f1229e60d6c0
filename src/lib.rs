//! LevelUp API Library
//!
//! Payment lifecycle services for the LevelUp e-commerce backend: payment
//! initiation and confirmation with token scoping, administrative overrides,
//! refunds, cancellation, and the atomic stock-reservation primitive that
//! keeps inventory consistent with payment status.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod migrator;
pub mod services;

use crate::auth::TokenService;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::payments::PaymentService;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared application state wired once at startup and handed to whatever
/// frontend (HTTP router, job runner, test harness) drives the services.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub config: AppConfig,
    pub event_sender: EventSender,
    pub tokens: Arc<TokenService>,
    pub payments: Arc<PaymentService>,
}

/// Connects to the database, optionally migrates, and wires up the service
/// graph. Returns the state plus the receiving end of the event channel;
/// the caller decides who consumes events.
pub async fn build_app_state(
    config: AppConfig,
) -> Result<(AppState, mpsc::Receiver<Event>), ServiceError> {
    let pool = db::establish_connection_from_config(&config).await?;
    if config.auto_migrate {
        db::run_migrations(&pool).await?;
    }
    let db = Arc::new(pool);

    let (event_sender, event_receiver) = events::event_channel(config.event_channel_capacity);
    let tokens = Arc::new(TokenService::from_config(&config));
    let payments = Arc::new(PaymentService::new(
        db.clone(),
        tokens.clone(),
        Some(Arc::new(event_sender.clone())),
    ));

    let state = AppState {
        db,
        config,
        event_sender,
        tokens,
        payments,
    };

    Ok((state, event_receiver))
}
