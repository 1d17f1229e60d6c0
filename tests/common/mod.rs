#![allow(dead_code)]

use chrono::Utc;
use levelup_api::{
    build_app_state,
    config::AppConfig,
    entities::{product, user},
    services::payments::PaymentService,
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use std::sync::Arc;

/// Helper harness backed by an in-memory SQLite database with the full
/// schema applied through the migrator.
pub struct TestApp {
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
        );
        cfg.auto_migrate = true;
        // One shared connection keeps every statement on the same in-memory
        // database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let (state, mut event_receiver) = build_app_state(cfg)
            .await
            .expect("failed to build test app state");

        // Drain events so senders never observe a closed channel.
        let event_task = tokio::spawn(async move { while event_receiver.recv().await.is_some() {} });

        Self {
            state,
            _event_task: event_task,
        }
    }

    pub fn payments(&self) -> Arc<PaymentService> {
        self.state.payments.clone()
    }

    /// Inserts an active user and returns its id.
    pub async fn seed_user(&self, email: &str) -> i64 {
        let inserted = user::ActiveModel {
            email: Set(email.to_string()),
            full_name: Set("Test User".to_string()),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed user");

        inserted.id
    }

    /// Inserts a product with the given stock and returns its id.
    pub async fn seed_product(&self, code: &str, price: Decimal, stock: i32) -> i64 {
        let now = Utc::now();
        let inserted = product::ActiveModel {
            name: Set(format!("Product {}", code)),
            code: Set(code.to_string()),
            price: Set(price),
            stock: Set(stock),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed product");

        inserted.id
    }
}
