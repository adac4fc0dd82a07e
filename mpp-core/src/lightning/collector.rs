//! Multi-Part Payments (MPP), receive side
//!
//! Incoming HTLCs carrying `payment_data` are held per payment hash until
//! their amounts reach the declared total; then all of them are fulfilled at
//! once. Protocol violations are answered with [`HtlcAction::Reject`], never
//! merged. Payments that do not complete within the MPP timeout are failed
//! back, either when the next part arrives or from [`MppPaymentCollector::check_timeouts`].

use super::failure::FailureCode;
use super::payment::{HtlcId, PaymentHash, PaymentSecret};
use super::wire::FinalHopPayload;
use crate::config::MppConfig;
use crate::util::clock::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Internal collector faults. Rejections are [`HtlcAction`]s, not errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

/// An HTLC that terminated at this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingHtlc {
    pub htlc_id: HtlcId,
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    pub cltv_expiry: u32,
    pub payment_secret: Option<PaymentSecret>,
    pub total_msat: Option<u64>,
}

impl IncomingHtlc {
    /// Build from a decoded final-hop onion payload
    pub fn from_final_hop(
        htlc_id: HtlcId,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        payload: &FinalHopPayload,
    ) -> Self {
        Self {
            htlc_id,
            payment_hash,
            amount_msat: payload.amt_to_forward_msat,
            cltv_expiry,
            payment_secret: payload.payment_data.as_ref().map(|d| d.payment_secret),
            total_msat: payload.payment_data.as_ref().map(|d| d.total_msat),
        }
    }
}

/// Why an HTLC was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    IncorrectOrUnknownPaymentDetails,
    FinalIncorrectHtlcAmount,
    MppTimeout,
}

impl RejectReason {
    /// Failure code to put in the error onion
    pub fn failure_code(&self) -> FailureCode {
        match self {
            RejectReason::IncorrectOrUnknownPaymentDetails => {
                FailureCode::IncorrectOrUnknownPaymentDetails
            }
            RejectReason::FinalIncorrectHtlcAmount => FailureCode::FinalIncorrectHtlcAmount,
            RejectReason::MppTimeout => FailureCode::MppTimeout,
        }
    }
}

/// What the caller should do with an incoming HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcAction {
    /// Keep the HTLC open; more parts are expected
    Hold { received_msat: u64, remaining_msat: u64 },
    /// Settle every listed HTLC with the preimage
    Fulfill { htlc_ids: Vec<HtlcId>, received_msat: u64 },
    /// Fail every HTLC in `fail_back`; it always contains the incoming one
    Reject {
        reason: RejectReason,
        fail_back: Vec<HtlcId>,
    },
}

/// One held part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedPart {
    pub htlc_id: HtlcId,
    pub amount_msat: u64,
    pub cltv_expiry: u32,
}

/// Parts collected so far for one payment hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMppPayment {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub total_msat: u64,
    pub received_msat: u64,
    pub parts: Vec<ReceivedPart>,
    pub created_at_ms: u64,
    pub timeout_at_ms: u64,
}

impl PendingMppPayment {
    fn htlc_ids(&self) -> Vec<HtlcId> {
        self.parts.iter().map(|p| p.htlc_id).collect()
    }
}

/// Receive-side MPP aggregator
pub struct MppPaymentCollector {
    pending: Mutex<HashMap<PaymentHash, PendingMppPayment>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl MppPaymentCollector {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            clock,
        }
    }

    pub fn from_config(config: &MppConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(Duration::from_secs(config.mpp_timeout_secs), clock)
    }

    /// Decide what to do with one incoming HTLC
    pub fn process_incoming_htlc(&self, htlc: IncomingHtlc) -> CollectorResult<HtlcAction> {
        let now = self.clock.now_millis();
        let mut pending = self.pending.lock().map_err(|_| CollectorError::LockPoisoned)?;
        let hash = htlc.payment_hash;

        let payment = match pending.get_mut(&hash) {
            Some(payment) => {
                let secret_matches = htlc
                    .payment_secret
                    .map(|s| bool::from(s.as_bytes().ct_eq(payment.payment_secret.as_bytes())))
                    .unwrap_or(false);
                if !secret_matches {
                    warn!("Rejecting HTLC for {}: payment secret mismatch", hash.short_hex());
                    return Ok(reject(RejectReason::IncorrectOrUnknownPaymentDetails, &htlc));
                }
                if htlc.total_msat != Some(payment.total_msat) {
                    warn!(
                        "Rejecting HTLC for {}: total {:?} does not match {}",
                        hash.short_hex(),
                        htlc.total_msat,
                        payment.total_msat
                    );
                    return Ok(reject(RejectReason::FinalIncorrectHtlcAmount, &htlc));
                }
                if now > payment.timeout_at_ms {
                    let mut fail_back = payment.htlc_ids();
                    fail_back.push(htlc.htlc_id);
                    pending.remove(&hash);
                    warn!(
                        "MPP payment {} timed out, failing back {} HTLCs",
                        hash.short_hex(),
                        fail_back.len()
                    );
                    return Ok(HtlcAction::Reject {
                        reason: RejectReason::MppTimeout,
                        fail_back,
                    });
                }
                payment
            }
            None => {
                let (Some(payment_secret), Some(total_msat)) =
                    (htlc.payment_secret, htlc.total_msat)
                else {
                    debug!(
                        "Rejecting HTLC for unknown payment {} without payment_data",
                        hash.short_hex()
                    );
                    return Ok(reject(RejectReason::IncorrectOrUnknownPaymentDetails, &htlc));
                };
                debug!(
                    "New MPP payment {} expecting {} msat",
                    hash.short_hex(),
                    total_msat
                );
                pending.entry(hash).or_insert(PendingMppPayment {
                    payment_hash: hash,
                    payment_secret,
                    total_msat,
                    received_msat: 0,
                    parts: Vec::new(),
                    created_at_ms: now,
                    timeout_at_ms: now.saturating_add(self.timeout.as_millis() as u64),
                })
            }
        };

        payment.parts.push(ReceivedPart {
            htlc_id: htlc.htlc_id,
            amount_msat: htlc.amount_msat,
            cltv_expiry: htlc.cltv_expiry,
        });
        payment.received_msat = payment.received_msat.saturating_add(htlc.amount_msat);

        if payment.received_msat >= payment.total_msat {
            let htlc_ids = payment.htlc_ids();
            let received_msat = payment.received_msat;
            pending.remove(&hash);
            info!(
                "MPP payment {} complete: {} msat in {} parts",
                hash,
                received_msat,
                htlc_ids.len()
            );
            return Ok(HtlcAction::Fulfill {
                htlc_ids,
                received_msat,
            });
        }

        debug!(
            "Holding part of {}: {}/{} msat",
            hash.short_hex(),
            payment.received_msat,
            payment.total_msat
        );
        Ok(HtlcAction::Hold {
            received_msat: payment.received_msat,
            remaining_msat: payment.total_msat - payment.received_msat,
        })
    }

    /// Remove every payment past its timeout and return the HTLCs to fail back
    pub fn check_timeouts(&self) -> CollectorResult<Vec<HtlcId>> {
        let now = self.clock.now_millis();
        let mut pending = self.pending.lock().map_err(|_| CollectorError::LockPoisoned)?;

        let mut expired = Vec::new();
        pending.retain(|hash, payment| {
            if now > payment.timeout_at_ms {
                warn!(
                    "MPP payment {} timed out with {}/{} msat",
                    hash.short_hex(),
                    payment.received_msat,
                    payment.total_msat
                );
                expired.extend(payment.htlc_ids());
                false
            } else {
                true
            }
        });
        Ok(expired)
    }

    pub fn pending_payment(
        &self,
        payment_hash: &PaymentHash,
    ) -> CollectorResult<Option<PendingMppPayment>> {
        let pending = self.pending.lock().map_err(|_| CollectorError::LockPoisoned)?;
        Ok(pending.get(payment_hash).cloned())
    }

    pub fn pending_count(&self) -> CollectorResult<usize> {
        let pending = self.pending.lock().map_err(|_| CollectorError::LockPoisoned)?;
        Ok(pending.len())
    }
}

fn reject(reason: RejectReason, htlc: &IncomingHtlc) -> HtlcAction {
    HtlcAction::Reject {
        reason,
        fail_back: vec![htlc.htlc_id],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::wire::PaymentData;
    use crate::util::clock::ManualClock;

    fn collector() -> (MppPaymentCollector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (
            MppPaymentCollector::new(Duration::from_secs(60), clock.clone()),
            clock,
        )
    }

    fn htlc(id: u64, amount_msat: u64, secret: [u8; 32], total_msat: u64) -> IncomingHtlc {
        IncomingHtlc {
            htlc_id: HtlcId(id),
            payment_hash: PaymentHash::new([1; 32]),
            amount_msat,
            cltv_expiry: 800_000,
            payment_secret: Some(PaymentSecret::new(secret)),
            total_msat: Some(total_msat),
        }
    }

    #[test]
    fn test_single_part_fulfills_immediately() {
        let (collector, _) = collector();
        let action = collector.process_incoming_htlc(htlc(1, 1_000, [5; 32], 1_000)).unwrap();
        assert_eq!(
            action,
            HtlcAction::Fulfill {
                htlc_ids: vec![HtlcId(1)],
                received_msat: 1_000
            }
        );
        assert_eq!(collector.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_payment_without_payment_data_is_rejected() {
        let (collector, _) = collector();
        let mut bare = htlc(1, 1_000, [5; 32], 1_000);
        bare.total_msat = None;
        assert_eq!(
            collector.process_incoming_htlc(bare).unwrap(),
            HtlcAction::Reject {
                reason: RejectReason::IncorrectOrUnknownPaymentDetails,
                fail_back: vec![HtlcId(1)]
            }
        );
    }

    #[test]
    fn test_total_mismatch_is_rejected() {
        let (collector, _) = collector();
        collector.process_incoming_htlc(htlc(1, 400, [5; 32], 1_000)).unwrap();
        let action = collector.process_incoming_htlc(htlc(2, 600, [5; 32], 2_000)).unwrap();
        assert!(matches!(
            action,
            HtlcAction::Reject {
                reason: RejectReason::FinalIncorrectHtlcAmount,
                ..
            }
        ));
        // The held part is untouched
        assert_eq!(
            collector
                .pending_payment(&PaymentHash::new([1; 32]))
                .unwrap()
                .unwrap()
                .received_msat,
            400
        );
    }

    #[test]
    fn test_late_part_fails_back_everything() {
        let (collector, clock) = collector();
        collector.process_incoming_htlc(htlc(1, 400, [5; 32], 1_000)).unwrap();
        clock.advance(Duration::from_secs(61));

        let action = collector.process_incoming_htlc(htlc(2, 600, [5; 32], 1_000)).unwrap();
        assert_eq!(
            action,
            HtlcAction::Reject {
                reason: RejectReason::MppTimeout,
                fail_back: vec![HtlcId(1), HtlcId(2)]
            }
        );
        assert_eq!(collector.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_check_timeouts_sweeps_expired() {
        let (collector, clock) = collector();
        collector.process_incoming_htlc(htlc(1, 400, [5; 32], 1_000)).unwrap();
        assert!(collector.check_timeouts().unwrap().is_empty());

        clock.advance(Duration::from_secs(61));
        assert_eq!(collector.check_timeouts().unwrap(), vec![HtlcId(1)]);
        assert_eq!(collector.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_from_final_hop() {
        let payload = FinalHopPayload {
            amt_to_forward_msat: 250,
            outgoing_cltv_value: 800_010,
            payment_data: Some(PaymentData::new(PaymentSecret::new([8; 32]), 1_000)),
        };
        let htlc =
            IncomingHtlc::from_final_hop(HtlcId(4), PaymentHash::new([1; 32]), 800_010, &payload);
        assert_eq!(htlc.amount_msat, 250);
        assert_eq!(htlc.total_msat, Some(1_000));
        assert_eq!(htlc.payment_secret, Some(PaymentSecret::new([8; 32])));
        assert_eq!(RejectReason::MppTimeout.failure_code(), FailureCode::MppTimeout);
    }
}
