//! Order verification against the broker's open-order listing.
//!
//! A placement returning an id does not mean the order is visible yet, and
//! a listing that misses it once does not mean it is gone. The verifier
//! polls a bounded number of times and distinguishes three outcomes:
//!
//! ```text
//! present, any size      -> Confirmed(listed order)
//! never seen             -> NotFound       (only after every attempt)
//! every listing failed   -> Err(VerificationTimeout)   (unknown: defer)
//! ```
//!
//! A present order whose size differs from the expected one is still
//! `Confirmed`: the size is a repair for the reconciler, never a reason to
//! place another order. Callers compare sizes with
//! [`Verification::size_mismatch`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use bracket_domain::ProtectiveKind;

use crate::error::{ExecError, ExecResult};
use crate::ports::{BrokerGateway, BrokerOrder};

/// Outcome of [`OrderVerifier::verify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    /// Listed, carrying the order as the broker shows it
    Confirmed(BrokerOrder),
    NotFound,
}

impl Verification {
    pub fn is_present(&self) -> bool {
        matches!(self, Verification::Confirmed(_))
    }

    pub fn order(&self) -> Option<&BrokerOrder> {
        match self {
            Verification::Confirmed(order) => Some(order),
            Verification::NotFound => None,
        }
    }

    /// Present, but listed with a size other than `expected`.
    pub fn size_mismatch(&self, expected: u32) -> bool {
        self.order().is_some_and(|order| order.size != expected)
    }
}

/// Outcome of [`OrderVerifier::verify_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absence {
    Gone,
    StillPresent,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Wait before each listing attempt
    pub delay: Duration,
    /// Attempts used when the caller does not choose
    pub max_attempts: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

/// Polls the broker until an order is seen or the attempt budget runs out.
pub struct OrderVerifier<G: BrokerGateway> {
    gateway: Arc<G>,
    config: VerifierConfig,
}

impl<G: BrokerGateway> OrderVerifier<G> {
    pub fn new(gateway: Arc<G>, config: VerifierConfig) -> Self {
        Self { gateway, config }
    }

    pub fn default_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Confirm that `order_id` is a working order.
    ///
    /// Waits `delay` before every listing to absorb propagation lag.
    pub async fn verify(
        &self,
        instrument: &str,
        order_id: &str,
        expected_size: u32,
        kind: ProtectiveKind,
        max_attempts: u32,
    ) -> ExecResult<Verification> {
        let attempts = max_attempts.max(1);
        let mut listed = false;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.delay).await;

            let orders = match self.gateway.list_open_orders(instrument).await {
                Ok(orders) => orders,
                Err(e) if e.is_transient() => {
                    warn!(order_id, attempt, error = %e, "Listing failed during verification");
                    continue;
                }
                Err(e) => return Err(e),
            };
            listed = true;

            if let Some(order) = orders.into_iter().find(|o| o.order_id == order_id) {
                if order.kind.as_protective() != Some(kind) {
                    warn!(order_id, expected = %kind, actual = ?order.kind, "Verified order has unexpected type");
                }
                if order.size == expected_size {
                    debug!(order_id, attempt, "Order confirmed");
                } else {
                    debug!(order_id, attempt, expected_size, actual = order.size, "Order confirmed with size mismatch");
                }
                return Ok(Verification::Confirmed(order));
            }
            debug!(order_id, attempt, "Order not yet visible");
        }

        if listed {
            warn!(order_id, attempts, %kind, "Order not found after all attempts");
            Ok(Verification::NotFound)
        } else {
            Err(ExecError::VerificationTimeout {
                order_id: order_id.to_string(),
                attempts,
            })
        }
    }

    /// Confirm that `order_id` no longer appears in the listing.
    pub async fn verify_absent(&self, instrument: &str, order_id: &str, max_attempts: u32) -> ExecResult<Absence> {
        let attempts = max_attempts.max(1);
        let mut listed = false;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.delay).await;

            match self.gateway.list_open_orders(instrument).await {
                Ok(orders) => {
                    listed = true;
                    if orders.iter().all(|o| o.order_id != order_id) {
                        debug!(order_id, attempt, "Order verified absent");
                        return Ok(Absence::Gone);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(order_id, attempt, error = %e, "Listing failed during absence check");
                }
                Err(e) => return Err(e),
            }
        }

        if listed {
            Ok(Absence::StillPresent)
        } else {
            Err(ExecError::VerificationTimeout {
                order_id: order_id.to_string(),
                attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::OrderRequest;
    use crate::stub::{StubBroker, StubFailure, StubOp};
    use bracket_domain::{Instrument, OrderSide, Price};
    use rust_decimal_macros::dec;

    const MGC: &str = "CON.F.US.MGC.Z25";

    fn setup() -> (Arc<StubBroker>, OrderVerifier<StubBroker>) {
        let instrument = Instrument::new(MGC, dec!(0.1), dec!(1)).unwrap();
        let broker = Arc::new(StubBroker::new(instrument, Price::new(dec!(2650)).unwrap()));
        let verifier = OrderVerifier::new(broker.clone(), VerifierConfig::default());
        (broker, verifier)
    }

    fn stop_request(size: u32) -> OrderRequest {
        OrderRequest::protective(ProtectiveKind::Stop, MGC, OrderSide::Sell, size, Price::new(dec!(2645)).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_after_propagation_lag() {
        let (broker, verifier) = setup();
        broker.set_listing_lag(2);
        let id = broker.place_order(&stop_request(4)).await.unwrap();

        let result = verifier.verify(MGC, &id, 4, ProtectiveKind::Stop, 5).await.unwrap();
        assert!(matches!(result, Verification::Confirmed(_)));
        assert!(!result.size_mismatch(4));
        assert_eq!(broker.calls(StubOp::ListOrders), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_mismatch_is_still_confirmed() {
        let (broker, verifier) = setup();
        let id = broker.place_order(&stop_request(4)).await.unwrap();
        broker.set_order_size(&id, 8);

        let result = verifier.verify(MGC, &id, 4, ProtectiveKind::Stop, 3).await.unwrap();
        assert!(matches!(&result, Verification::Confirmed(order) if order.order_id == id));
        assert!(result.size_mismatch(4));
        assert!(!result.size_mismatch(8));
        assert_eq!(result.order().unwrap().size, 8);
        assert_eq!(broker.calls(StubOp::ListOrders), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_only_after_all_attempts() {
        let (broker, verifier) = setup();
        let result = verifier.verify(MGC, "STUB-99", 4, ProtectiveKind::Stop, 3).await.unwrap();
        assert_eq!(result, Verification::NotFound);
        assert_eq!(broker.calls(StubOp::ListOrders), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_listings_failing_is_unknown_not_absent() {
        let (broker, verifier) = setup();
        for _ in 0..2 {
            broker.fail_next(StubOp::ListOrders, StubFailure::Transient);
        }

        let err = verifier.verify(MGC, "STUB-1", 4, ProtectiveKind::Stop, 2).await.unwrap_err();
        assert!(matches!(err, ExecError::VerificationTimeout { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_absent() {
        let (broker, verifier) = setup();
        let id = broker.place_order(&stop_request(4)).await.unwrap();

        assert_eq!(verifier.verify_absent(MGC, &id, 2).await.unwrap(), Absence::StillPresent);
        broker.cancel_order(&id).await.unwrap();
        assert_eq!(verifier.verify_absent(MGC, &id, 2).await.unwrap(), Absence::Gone);
    }
}
