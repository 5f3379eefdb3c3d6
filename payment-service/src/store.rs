use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::DbPool;
use shared::error::is_unique_violation;
use shared::outbox::{self, NewOutboxEvent};
use shared::{CheckoutError, PaymentRequest};
use uuid::Uuid;

use crate::models::*;
use crate::provider::CheckoutSession;
use crate::schema::payments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The session id already belongs to another payment.
    SessionConflict,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyTerminal,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, CheckoutError>;

    async fn find_by_session(&self, session_id: &str) -> Result<Option<Payment>, CheckoutError>;

    /// Inserts a `PENDING` payment unless one exists for the order, then
    /// returns whichever row is stored.
    async fn create_pending(&self, request: &PaymentRequest) -> Result<Payment, CheckoutError>;

    /// Stores the session and marks the payment `URL_READY`, writing
    /// `message` to the outbox in the same transaction.
    async fn attach_session(
        &self,
        payment_id: Uuid,
        session: &CheckoutSession,
        message: NewOutboxEvent,
    ) -> Result<AttachOutcome, CheckoutError>;

    /// Moves a non-terminal payment to `status` and writes `message` to the
    /// outbox. Terminal payments are left untouched.
    async fn finalize(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        at: DateTime<Utc>,
        message: NewOutboxEvent,
    ) -> Result<FinalizeOutcome, CheckoutError>;

    async fn mark_published(&self, outbox_id: Uuid) -> Result<(), CheckoutError>;
}

pub struct PgPaymentStore {
    pool: DbPool,
}

impl PgPaymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, CheckoutError> {
        let mut conn = self.pool.get().await?;
        let payment = payments::table
            .filter(payments::order_id.eq(order_id))
            .select(Payment::as_select())
            .first::<Payment>(&mut conn)
            .await
            .optional()?;
        Ok(payment)
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Option<Payment>, CheckoutError> {
        let mut conn = self.pool.get().await?;
        let payment = payments::table
            .filter(payments::external_session_id.eq(session_id))
            .select(Payment::as_select())
            .first::<Payment>(&mut conn)
            .await
            .optional()?;
        Ok(payment)
    }

    async fn create_pending(&self, request: &PaymentRequest) -> Result<Payment, CheckoutError> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(payments::table)
            .values(&NewPayment::pending(request))
            .on_conflict(payments::order_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let payment = payments::table
            .filter(payments::order_id.eq(request.order_id))
            .select(Payment::as_select())
            .first::<Payment>(&mut conn)
            .await?;
        Ok(payment)
    }

    async fn attach_session(
        &self,
        payment_id: Uuid,
        session: &CheckoutSession,
        message: NewOutboxEvent,
    ) -> Result<AttachOutcome, CheckoutError> {
        let mut conn = self.pool.get().await?;
        let session = session.clone();

        conn.transaction::<_, CheckoutError, _>(|conn| {
            Box::pin(async move {
                let owner = payments::table
                    .filter(payments::external_session_id.eq(session.id.as_str()))
                    .filter(payments::id.ne(payment_id))
                    .select(payments::id)
                    .first::<Uuid>(conn)
                    .await
                    .optional()?;
                if owner.is_some() {
                    return Ok(AttachOutcome::SessionConflict);
                }

                let updated = diesel::update(
                    payments::table
                        .filter(payments::id.eq(payment_id))
                        .filter(payments::status.ne_all(PaymentStatus::TERMINAL)),
                )
                .set((
                    payments::external_session_id.eq(Some(session.id.as_str())),
                    payments::checkout_url.eq(Some(session.url.as_str())),
                    payments::status.eq(PaymentStatus::UrlReady.as_str()),
                    payments::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await;

                match updated {
                    Ok(0) => return Ok(AttachOutcome::AlreadyTerminal),
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => return Ok(AttachOutcome::SessionConflict),
                    Err(e) => return Err(e.into()),
                }

                outbox::insert(conn, &message).await?;
                Ok(AttachOutcome::Attached)
            })
        })
        .await
    }

    async fn finalize(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        at: DateTime<Utc>,
        message: NewOutboxEvent,
    ) -> Result<FinalizeOutcome, CheckoutError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, CheckoutError, _>(|conn| {
            Box::pin(async move {
                let target = payments::table
                    .filter(payments::id.eq(payment_id))
                    .filter(payments::status.ne_all(PaymentStatus::TERMINAL));

                let updated = match status {
                    PaymentStatus::Succeeded => {
                        diesel::update(target)
                            .set((
                                payments::status.eq(status.as_str()),
                                payments::succeeded_at.eq(Some(at)),
                                payments::updated_at.eq(at),
                            ))
                            .execute(conn)
                            .await?
                    }
                    PaymentStatus::Failed => {
                        diesel::update(target)
                            .set((
                                payments::status.eq(status.as_str()),
                                payments::failed_at.eq(Some(at)),
                                payments::updated_at.eq(at),
                            ))
                            .execute(conn)
                            .await?
                    }
                    PaymentStatus::Pending | PaymentStatus::UrlReady => {
                        return Err(CheckoutError::Validation(format!(
                            "{} is not a terminal payment status",
                            status.as_str()
                        )));
                    }
                };

                if updated == 0 {
                    return Ok(FinalizeOutcome::AlreadyTerminal);
                }

                outbox::insert(conn, &message).await?;
                Ok(FinalizeOutcome::Finalized)
            })
        })
        .await
    }

    async fn mark_published(&self, outbox_id: Uuid) -> Result<(), CheckoutError> {
        let mut conn = self.pool.get().await?;
        outbox::mark_processed(&mut conn, outbox_id).await?;
        Ok(())
    }
}

#[cfg(test)]
pub use memory::InMemoryPaymentStore;
