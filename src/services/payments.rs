use crate::{
    auth::{AuthUser, TokenService},
    db::DbPool,
    entities::payment::{self, Entity as PaymentEntity, LineItem, PaymentStatus},
    entities::user::Entity as UserEntity,
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const MSG_ALREADY_PROCESSED: &str = "Payment already processed or cancelled";
const MSG_PROCESSED: &str = "Payment processed successfully";
const MSG_DECLINED: &str = "Payment declined: card number failed verification";

/// Request/Response types for the payment service
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    pub total_amount: Decimal,
    pub tax_amount: Option<Decimal>,
    pub shipping_cost: Option<Decimal>,
    #[validate(length(min = 1, message = "Payment method is required"))]
    pub payment_method: String,
    #[validate(length(min = 1, message = "At least one line item is required"))]
    pub items: Vec<LineItem>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    #[validate(length(min = 1, message = "Payment token is required"))]
    pub payment_token: String,
    pub card_number: Option<String>,
    pub card_holder_name: Option<String>,
    pub expiration_date: Option<String>,
    pub cvv: Option<String>,
    pub shipping_address: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_country: Option<String>,
    pub shipping_postal_code: Option<String>,
    pub shipping_phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiatePaymentResponse {
    pub payment_id: i64,
    pub payment_token: String,
    pub status: PaymentStatus,
    pub total_amount: Decimal,
    pub expires_in_secs: u64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmPaymentResponse {
    pub success: bool,
    pub message: String,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub id: i64,
    pub user_id: i64,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub items: Vec<LineItem>,
    pub total_amount: Decimal,
    pub tax_amount: Option<Decimal>,
    pub shipping_cost: Option<Decimal>,
    pub payment_method: String,
    pub card_last_four: Option<String>,
    pub card_network: Option<String>,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub status_message: String,
    pub shipping_address: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_country: Option<String>,
    pub shipping_postal_code: Option<String>,
    pub shipping_phone: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// Card metadata captured on a successful confirmation.
struct CardMetadata {
    last_four: String,
    network: Option<String>,
}

/// Service driving a payment through its lifecycle:
/// `PENDING -> COMPLETED | FAILED | CANCELLED`, and `COMPLETED -> REFUNDED`.
///
/// Completion decrements product stock for every line in the payment's
/// snapshot inside the same transaction as the status change, so a payment
/// can never read `COMPLETED` while a decrement was refused.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DbPool>,
    tokens: Arc<TokenService>,
    event_sender: Option<Arc<EventSender>>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DbPool>,
        tokens: Arc<TokenService>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            tokens,
            event_sender,
        }
    }

    /// Creates a pending payment and mints its single-use confirmation token.
    ///
    /// No stock is reserved here; inventory is only touched when the payment
    /// is confirmed, so abandoned carts hold nothing.
    #[instrument(skip(self, request), fields(user_id = user_id, amount = %request.total_amount))]
    pub async fn initiate_payment(
        &self,
        user_id: i64,
        request: InitiatePaymentRequest,
    ) -> Result<InitiatePaymentResponse, ServiceError> {
        request.validate()?;
        validate_amounts(&request)?;
        validate_line_items(&request.items)?;

        let db = &*self.db;

        let user = UserEntity::find_by_id(user_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("User not found with id: {}", user_id))
            })?;

        let items_json = serde_json::to_value(&request.items)
            .map_err(|e| ServiceError::InternalError(format!("snapshot serialization: {}", e)))?;
        let now = Utc::now();

        let txn = db.begin().await?;

        let inserted = payment::ActiveModel {
            user_id: Set(user.id),
            user_email: Set(Some(user.email.clone())),
            user_name: Set(Some(user.full_name.clone())),
            items: Set(items_json),
            total_amount: Set(request.total_amount),
            tax_amount: Set(request.tax_amount),
            shipping_cost: Set(request.shipping_cost),
            payment_method: Set(request.payment_method.clone()),
            status: Set(PaymentStatus::Pending),
            status_message: Set("Payment token generated, awaiting processing".to_string()),
            notes: Set(request.notes.clone()),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        // The token embeds the payment id, so it can only be minted once the
        // row exists.
        let token = self.tokens.issue_payment_token(user.id, inserted.id)?;

        let mut pending: payment::ActiveModel = inserted.clone().into();
        pending.payment_token = Set(Some(token.clone()));
        pending.update(&txn).await?;

        txn.commit().await?;

        info!(payment_id = inserted.id, user_id = user.id, "payment initiated");
        self.emit(Event::PaymentInitiated {
            payment_id: inserted.id,
            user_id: user.id,
        })
        .await;

        let ttl = self.tokens.payment_token_ttl();
        Ok(InitiatePaymentResponse {
            payment_id: inserted.id,
            payment_token: token,
            status: PaymentStatus::Pending,
            total_amount: request.total_amount,
            expires_in_secs: ttl.as_secs(),
            message: format!(
                "Payment token generated successfully. Token is valid for {} minutes.",
                ttl.as_secs() / 60
            ),
        })
    }

    /// Confirms a pending payment with its bearer token and card details.
    ///
    /// Precondition order: token verifies, payment exists, payment is still
    /// pending, token belongs to this exact payment. A replayed confirmation
    /// lands on the pending check and is rejected rather than applied twice.
    #[instrument(skip(self, request), fields(payment_id = payment_id))]
    pub async fn confirm_payment(
        &self,
        payment_id: i64,
        request: ConfirmPaymentRequest,
    ) -> Result<ConfirmPaymentResponse, ServiceError> {
        request.validate()?;

        let claims = self.tokens.verify_payment_token(&request.payment_token)?;

        let payment = self.find_payment(payment_id).await?;

        if payment.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidStatus(MSG_ALREADY_PROCESSED.into()));
        }

        if claims.payment_id != payment.id
            || payment.payment_token.as_deref() != Some(request.payment_token.as_str())
        {
            return Err(ServiceError::TokenMismatch(
                "Payment token does not belong to this payment".to_string(),
            ));
        }

        let digits = request
            .card_number
            .as_deref()
            .map(sanitized_card_digits)
            .unwrap_or_default();

        if !card_is_approved(&digits) {
            return self.decline_payment(&payment).await;
        }

        let card = CardMetadata {
            last_four: digits[digits.len() - 4..].to_string(),
            network: card_network_for(&digits),
        };

        let transaction_id = self
            .complete_pending_payment(&payment, MSG_PROCESSED, Some(card), Some(&request))
            .await?;

        info!(
            payment_id = payment.id,
            transaction_id = %transaction_id,
            "payment completed"
        );
        self.emit(Event::PaymentCompleted {
            payment_id: payment.id,
            transaction_id: transaction_id.clone(),
        })
        .await;

        Ok(ConfirmPaymentResponse {
            success: true,
            message: MSG_PROCESSED.to_string(),
            transaction_id: Some(transaction_id),
            status: PaymentStatus::Completed,
        })
    }

    /// Completes a stuck pending payment without token or card checks.
    ///
    /// For operator use; the caller's authority is checked upstream. Stock
    /// is decremented under the same all-or-nothing contract as a regular
    /// confirmation.
    #[instrument(skip(self), fields(payment_id = payment_id))]
    pub async fn confirm_payment_as_admin(
        &self,
        payment_id: i64,
    ) -> Result<ConfirmPaymentResponse, ServiceError> {
        let payment = self.find_payment(payment_id).await?;

        if payment.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidStatus(MSG_ALREADY_PROCESSED.into()));
        }

        let transaction_id = self
            .complete_pending_payment(
                &payment,
                "Payment confirmed by administrator",
                None,
                None,
            )
            .await?;

        info!(
            payment_id = payment.id,
            transaction_id = %transaction_id,
            "payment confirmed by administrator"
        );
        self.emit(Event::PaymentCompleted {
            payment_id: payment.id,
            transaction_id: transaction_id.clone(),
        })
        .await;

        Ok(ConfirmPaymentResponse {
            success: true,
            message: "Payment confirmed by administrator".to_string(),
            transaction_id: Some(transaction_id),
            status: PaymentStatus::Completed,
        })
    }

    /// Refunds a completed payment.
    ///
    /// Stock is not restored; restocking after a refund is an operator
    /// process, not a side effect of the status change.
    #[instrument(skip(self), fields(payment_id = payment_id))]
    pub async fn refund_payment(&self, payment_id: i64) -> Result<PaymentResponse, ServiceError> {
        let payment = self.find_payment(payment_id).await?;

        if payment.refunded_at.is_some() {
            return Err(ServiceError::AlreadyRefunded(format!(
                "Payment {} has already been refunded",
                payment_id
            )));
        }
        if payment.status != PaymentStatus::Completed {
            return Err(ServiceError::InvalidStatus(
                "Only completed payments can be refunded".to_string(),
            ));
        }

        let db = &*self.db;
        let updated = PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Refunded))
            .col_expr(
                payment::Column::StatusMessage,
                Expr::value("Payment refunded"),
            )
            .col_expr(payment::Column::RefundedAt, Expr::value(Some(Utc::now())))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .filter(payment::Column::RefundedAt.is_null())
            .exec(db)
            .await?;

        if updated.rows_affected == 0 {
            // Lost a race with a concurrent refund.
            return Err(ServiceError::InvalidStatus(
                "Only completed payments can be refunded".to_string(),
            ));
        }

        info!(payment_id = payment_id, "payment refunded");
        self.emit(Event::PaymentRefunded { payment_id }).await;

        let refunded = self.find_payment(payment_id).await?;
        payment_to_response(refunded)
    }

    /// Cancels a pending payment. Nothing was reserved, so nothing is
    /// released.
    #[instrument(skip(self), fields(payment_id = payment_id))]
    pub async fn cancel_payment(&self, payment_id: i64) -> Result<PaymentResponse, ServiceError> {
        let payment = self.find_payment(payment_id).await?;

        if payment.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidStatus(
                "Only pending payments can be cancelled".to_string(),
            ));
        }

        let db = &*self.db;
        let updated = PaymentEntity::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(PaymentStatus::Cancelled),
            )
            .col_expr(
                payment::Column::StatusMessage,
                Expr::value("Payment cancelled by user"),
            )
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus(MSG_ALREADY_PROCESSED.into()));
        }

        info!(payment_id = payment_id, "payment cancelled");
        self.emit(Event::PaymentCancelled { payment_id }).await;

        let cancelled = self.find_payment(payment_id).await?;
        payment_to_response(cancelled)
    }

    /// Fetches one payment, visible to its owner or to an administrator.
    #[instrument(skip(self, caller), fields(payment_id = payment_id, caller_id = caller.user_id))]
    pub async fn get_payment(
        &self,
        caller: &AuthUser,
        payment_id: i64,
    ) -> Result<PaymentResponse, ServiceError> {
        let payment = self.find_payment(payment_id).await?;

        if payment.user_id != caller.user_id && !caller.is_admin() {
            return Err(ServiceError::Forbidden(
                "You do not have access to this payment".to_string(),
            ));
        }

        payment_to_response(payment)
    }

    /// All payments owned by the requesting user, newest first.
    #[instrument(skip(self, caller), fields(caller_id = caller.user_id))]
    pub async fn list_user_payments(
        &self,
        caller: &AuthUser,
    ) -> Result<Vec<PaymentResponse>, ServiceError> {
        let db = &*self.db;
        let payments = PaymentEntity::find()
            .filter(payment::Column::UserId.eq(caller.user_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(db)
            .await?;

        payments.into_iter().map(payment_to_response).collect()
    }

    /// Every payment in the store, newest first. Administrative listing;
    /// access control happens upstream.
    #[instrument(skip(self))]
    pub async fn list_all_payments(&self) -> Result<Vec<PaymentResponse>, ServiceError> {
        let db = &*self.db;
        let payments = PaymentEntity::find()
            .order_by_desc(payment::Column::CreatedAt)
            .all(db)
            .await?;

        payments.into_iter().map(payment_to_response).collect()
    }

    /// Payments currently in the given status, newest first.
    #[instrument(skip(self))]
    pub async fn list_payments_by_status(
        &self,
        status: PaymentStatus,
    ) -> Result<Vec<PaymentResponse>, ServiceError> {
        let db = &*self.db;
        let payments = PaymentEntity::find()
            .filter(payment::Column::Status.eq(status))
            .order_by_desc(payment::Column::CreatedAt)
            .all(db)
            .await?;

        payments.into_iter().map(payment_to_response).collect()
    }

    /// Transitions a pending payment to `COMPLETED` and decrements stock for
    /// its snapshot, all inside one transaction.
    ///
    /// The status change is a conditional update on `status = PENDING`; of
    /// two concurrent confirmations, exactly one sees a row affected and the
    /// other gets `InvalidStatus`. A refused stock decrement aborts the whole
    /// transaction, including the staged status change.
    async fn complete_pending_payment(
        &self,
        payment: &payment::Model,
        status_message: &str,
        card: Option<CardMetadata>,
        request: Option<&ConfirmPaymentRequest>,
    ) -> Result<String, ServiceError> {
        let items = payment.line_items().map_err(|e| {
            ServiceError::InternalError(format!(
                "stored line-item snapshot is malformed for payment {}: {}",
                payment.id, e
            ))
        })?;

        let transaction_id = Uuid::new_v4().to_string();
        let db = &*self.db;
        let txn = db.begin().await?;

        let claimed = PaymentEntity::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(PaymentStatus::Completed),
            )
            .col_expr(payment::Column::StatusMessage, Expr::value(status_message))
            .col_expr(
                payment::Column::TransactionId,
                Expr::value(Some(transaction_id.clone())),
            )
            .col_expr(payment::Column::CompletedAt, Expr::value(Some(Utc::now())))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&txn)
            .await?;

        if claimed.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus(MSG_ALREADY_PROCESSED.into()));
        }

        for item in &items {
            let affected =
                catalog::decrement_stock_if_available(&txn, item.product_id, item.quantity)
                    .await?;
            if affected == 0 {
                // Dropping the transaction rolls back the status change and
                // any decrements already applied.
                return Err(ServiceError::InsufficientStock(format!(
                    "Insufficient stock for product {}",
                    item.product_id
                )));
            }
        }

        if card.is_some() || request.is_some() {
            let mut confirmed: payment::ActiveModel = payment.clone().into();
            if let Some(card) = card {
                confirmed.card_last_four = Set(Some(card.last_four));
                confirmed.card_network = Set(card.network);
            }
            if let Some(request) = request {
                confirmed.shipping_address = Set(request.shipping_address.clone());
                confirmed.shipping_city = Set(request.shipping_city.clone());
                confirmed.shipping_country = Set(request.shipping_country.clone());
                confirmed.shipping_postal_code = Set(request.shipping_postal_code.clone());
                confirmed.shipping_phone = Set(request.shipping_phone.clone());
                if request.notes.is_some() {
                    confirmed.notes = Set(request.notes.clone());
                }
            }
            confirmed.update(&txn).await?;
        }

        txn.commit().await?;
        Ok(transaction_id)
    }

    /// Marks a pending payment declined. The failure is recorded, not raised;
    /// callers receive a response with `success == false`.
    async fn decline_payment(
        &self,
        payment: &payment::Model,
    ) -> Result<ConfirmPaymentResponse, ServiceError> {
        let db = &*self.db;
        let updated = PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(payment::Column::StatusMessage, Expr::value(MSG_DECLINED))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus(MSG_ALREADY_PROCESSED.into()));
        }

        warn!(payment_id = payment.id, "payment declined");
        self.emit(Event::PaymentFailed {
            payment_id: payment.id,
            reason: MSG_DECLINED.to_string(),
        })
        .await;

        Ok(ConfirmPaymentResponse {
            success: false,
            message: MSG_DECLINED.to_string(),
            transaction_id: None,
            status: PaymentStatus::Failed,
        })
    }

    async fn find_payment(&self, payment_id: i64) -> Result<payment::Model, ServiceError> {
        let db = &*self.db;
        PaymentEntity::find_by_id(payment_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment not found with id: {}", payment_id))
            })
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send payment event");
            }
        }
    }
}

fn validate_amounts(request: &InitiatePaymentRequest) -> Result<(), ServiceError> {
    if request.total_amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Total amount must be greater than zero".to_string(),
        ));
    }
    for (label, value) in [
        ("Tax amount", request.tax_amount),
        ("Shipping cost", request.shipping_cost),
    ] {
        if let Some(v) = value {
            if v < Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "{} must not be negative",
                    label
                )));
            }
        }
    }
    Ok(())
}

fn validate_line_items(items: &[LineItem]) -> Result<(), ServiceError> {
    for item in items {
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Line item for product {} must have a positive quantity",
                item.product_id
            )));
        }
        if item.unit_price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Line item for product {} must not have a negative unit price",
                item.product_id
            )));
        }
    }
    Ok(())
}

fn payment_to_response(model: payment::Model) -> Result<PaymentResponse, ServiceError> {
    let items = model.line_items().map_err(|e| {
        ServiceError::InternalError(format!(
            "stored line-item snapshot is malformed for payment {}: {}",
            model.id, e
        ))
    })?;

    Ok(PaymentResponse {
        id: model.id,
        user_id: model.user_id,
        user_email: model.user_email,
        user_name: model.user_name,
        items,
        total_amount: model.total_amount,
        tax_amount: model.tax_amount,
        shipping_cost: model.shipping_cost,
        payment_method: model.payment_method,
        card_last_four: model.card_last_four,
        card_network: model.card_network,
        transaction_id: model.transaction_id,
        status: model.status,
        status_message: model.status_message,
        shipping_address: model.shipping_address,
        shipping_city: model.shipping_city,
        shipping_country: model.shipping_country,
        shipping_postal_code: model.shipping_postal_code,
        shipping_phone: model.shipping_phone,
        notes: model.notes,
        created_at: model.created_at,
        completed_at: model.completed_at,
        refunded_at: model.refunded_at,
    })
}

/// Strips whitespace from a supplied card number.
fn sanitized_card_digits(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Stand-in for a real gateway authorization: a card is approved when it is
/// exactly 16 digits once whitespace is removed.
fn card_is_approved(digits: &str) -> bool {
    digits.len() == 16 && digits.chars().all(|c| c.is_ascii_digit())
}

fn card_network_for(digits: &str) -> Option<String> {
    match digits.chars().next() {
        Some('4') => Some("VISA".to_string()),
        Some('5') => Some("MASTERCARD".to_string()),
        Some('6') => Some("DISCOVER".to_string()),
        _ => None,
    }
}
