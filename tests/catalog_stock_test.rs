mod common;

use assert_matches::assert_matches;
use common::TestApp;
use levelup_api::{errors::ServiceError, services::catalog};
use rust_decimal_macros::dec;

#[tokio::test]
async fn decrement_succeeds_up_to_the_exact_boundary() {
    let app = TestApp::new().await;
    let product_id = app.seed_product("SKU-1", dec!(10.00), 5).await;
    let db = &*app.state.db;

    let affected = catalog::decrement_stock_if_available(db, product_id, 5)
        .await
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(catalog::stock_on_hand(db, product_id).await.unwrap(), 0);
}

#[tokio::test]
async fn decrement_is_refused_when_stock_is_short() {
    let app = TestApp::new().await;
    let product_id = app.seed_product("SKU-1", dec!(10.00), 5).await;
    let db = &*app.state.db;

    let affected = catalog::decrement_stock_if_available(db, product_id, 6)
        .await
        .unwrap();
    assert_eq!(affected, 0);
    assert_eq!(catalog::stock_on_hand(db, product_id).await.unwrap(), 5);
}

#[tokio::test]
async fn repeated_decrements_stop_at_insufficient_stock() {
    let app = TestApp::new().await;
    let product_id = app.seed_product("SKU-1", dec!(10.00), 5).await;
    let db = &*app.state.db;

    assert_eq!(
        catalog::decrement_stock_if_available(db, product_id, 2)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        catalog::decrement_stock_if_available(db, product_id, 2)
            .await
            .unwrap(),
        1
    );
    // One unit left; a third two-unit decrement must not go negative.
    assert_eq!(
        catalog::decrement_stock_if_available(db, product_id, 2)
            .await
            .unwrap(),
        0
    );
    assert_eq!(catalog::stock_on_hand(db, product_id).await.unwrap(), 1);
}

#[tokio::test]
async fn decrement_of_unknown_product_affects_nothing() {
    let app = TestApp::new().await;
    let db = &*app.state.db;

    let affected = catalog::decrement_stock_if_available(db, 424242, 1)
        .await
        .unwrap();
    assert_eq!(affected, 0);
}

#[tokio::test]
async fn non_positive_quantities_are_rejected() {
    let app = TestApp::new().await;
    let product_id = app.seed_product("SKU-1", dec!(10.00), 5).await;
    let db = &*app.state.db;

    assert_matches!(
        catalog::decrement_stock_if_available(db, product_id, 0).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        catalog::decrement_stock_if_available(db, product_id, -3).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_eq!(catalog::stock_on_hand(db, product_id).await.unwrap(), 5);
}

#[tokio::test]
async fn stock_on_hand_for_unknown_product_is_not_found() {
    let app = TestApp::new().await;

    assert_matches!(
        catalog::stock_on_hand(&*app.state.db, 424242).await,
        Err(ServiceError::NotFound(_))
    );
}
