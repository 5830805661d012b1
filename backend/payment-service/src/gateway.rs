//! Seam to the payment gateway. The real integration lives outside this
//! service; the saga only needs the charge outcome.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub order_id: String,
    pub customer_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
}

/// Definitive answer from the gateway. A transport failure is an `Err` on
/// [`PaymentGateway::charge`] instead - the outcome is unknown and the caller
/// retries.
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Approved { gateway_reference: String },
    Declined { reason: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> anyhow::Result<ChargeOutcome>;
}

/// Development gateway that approves every charge.
pub struct AutoApproveGateway;

#[async_trait]
impl PaymentGateway for AutoApproveGateway {
    async fn charge(&self, request: &ChargeRequest) -> anyhow::Result<ChargeOutcome> {
        let gateway_reference = format!("auth_{}", Uuid::new_v4().simple());
        info!(
            order_id = %request.order_id,
            amount = %request.amount,
            currency = %request.currency,
            gateway_reference = %gateway_reference,
            "Charge approved (development gateway)"
        );
        Ok(ChargeOutcome::Approved { gateway_reference })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_approve_gateway_approves() {
        let gateway = AutoApproveGateway;
        let outcome = gateway
            .charge(&ChargeRequest {
                order_id: "ord_1".to_string(),
                customer_id: "cust_1".to_string(),
                amount: Decimal::new(9998, 2),
                currency: "USD".to_string(),
                payment_method: "card".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ChargeOutcome::Approved { .. }));
    }
}
