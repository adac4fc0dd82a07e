//! Multi-Part Payments (MPP), send side
//!
//! [`MppPaymentManager`] drives one payment from request to outcome:
//!
//! 1. validate the request, record a `Pending` payment;
//! 2. split the amount over the first-hop channels that are not excluded;
//! 3. route every part, preferring first hops no earlier part has taken;
//! 4. dispatch all parts concurrently, one task each, and join them;
//! 5. aggregate: `Complete` only if every part settled.
//!
//! A failed part updates the liquidity model and the exclusion manager, then is
//! retried on a new route (with backoff) while its retry budget lasts and the
//! failure is not one that retrying cannot fix.
//!
//! # Partial settlement
//! A payment whose parts partly settle and partly fail ends up `Failed` while
//! the settled parts have already released value. This layer has no unwind;
//! the snapshot returned to the caller lists every part so that a higher layer
//! can decide what to do with the settled ones.

use super::exclusion::PathExclusionManager;
use super::failure::{analyze_payment_error, FailureCode, RecommendedAction};
use super::liquidity::LiquidityModel;
use super::payment::{
    DispatchRequest, HtlcDispatcher, IdentifierError, NodeId, PartFailure, PartId, PaymentHash,
    PaymentPreimage, PaymentSecret, ShortChannelId,
};
use super::router::{Route, RouteConstraints, RoutingGraph};
use super::splitter::{PartAllocation, PaymentSplitter, SplitStrategy};
use super::wire::{FinalHopPayload, PaymentData};
use crate::config::MppConfig;
use crate::util::clock::Clock;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// CLTV expiry put in the final-hop payload when the caller does not set one
pub const DEFAULT_FINAL_CLTV_EXPIRY: u32 = 144;

/// Send-side errors. Only request problems are errors; everything that goes
/// wrong after the payment is recorded is reported in the payment snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MppError {
    #[error("Invalid payment request: {0}")]
    InvalidRequest(String),

    #[error("Invalid payment request: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("Payment already in progress: {payment_hash}")]
    PaymentInProgress { payment_hash: String },

    #[error("Payment not found: {payment_hash}")]
    PaymentNotFound { payment_hash: String },

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for send-side operations
pub type MppResult<T> = Result<T, MppError>;

/// Payment-level state. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MppPaymentStatus {
    Pending,
    InFlight,
    Complete,
    Failed,
}

impl MppPaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Part-level state. `Failed -> Pending` happens only when a retry starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MppPartStatus {
    Pending,
    InFlight,
    Settled,
    Failed,
}

/// A payment as submitted by the caller, with raw identifier bytes
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment_hash: Vec<u8>,
    pub payment_secret: Vec<u8>,
    pub amount_msat: u64,
    pub destination: Vec<u8>,
    /// Overrides the configured strategy for this payment
    pub strategy: Option<SplitStrategy>,
    pub final_cltv_expiry: u32,
}

impl PaymentRequest {
    pub fn new(
        payment_hash: impl Into<Vec<u8>>,
        payment_secret: impl Into<Vec<u8>>,
        amount_msat: u64,
        destination: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            payment_hash: payment_hash.into(),
            payment_secret: payment_secret.into(),
            amount_msat,
            destination: destination.into(),
            strategy: None,
            final_cltv_expiry: DEFAULT_FINAL_CLTV_EXPIRY,
        }
    }

    pub fn with_strategy(mut self, strategy: SplitStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_final_cltv_expiry(mut self, final_cltv_expiry: u32) -> Self {
        self.final_cltv_expiry = final_cltv_expiry;
        self
    }
}

/// One part of a payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MppPart {
    pub part_id: PartId,
    pub amount_msat: u64,
    /// Route of the latest attempt
    pub route: Option<Route>,
    pub status: MppPartStatus,
    pub retry_count: u32,
    pub preimage: Option<PaymentPreimage>,
    pub failure_code: Option<FailureCode>,
    pub failure_reason: Option<String>,
    pub settled_at_ms: Option<u64>,
}

impl MppPart {
    fn new(part_id: PartId, amount_msat: u64) -> Self {
        Self {
            part_id,
            amount_msat,
            route: None,
            status: MppPartStatus::Pending,
            retry_count: 0,
            preimage: None,
            failure_code: None,
            failure_reason: None,
            settled_at_ms: None,
        }
    }

    fn mark_failed(&mut self, code: FailureCode, reason: String) {
        self.status = MppPartStatus::Failed;
        self.failure_code = Some(code);
        self.failure_reason = Some(reason);
    }

    /// Fee paid by this part, if it settled
    pub fn fee_msat(&self) -> u64 {
        match (self.status, &self.route) {
            (MppPartStatus::Settled, Some(route)) => route.total_fee_msat,
            _ => 0,
        }
    }
}

/// A multi-part payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MppPayment {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub total_amount_msat: u64,
    pub destination: NodeId,
    pub parts: Vec<MppPart>,
    pub status: MppPaymentStatus,
    /// Concrete strategy the split used
    pub strategy: Option<SplitStrategy>,
    pub total_fees_msat: u64,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub failure_reason: Option<String>,
}

impl MppPayment {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn settled_amount_msat(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.status == MppPartStatus::Settled)
            .map(|p| p.amount_msat)
            .sum()
    }

    pub fn settled_parts(&self) -> Vec<&MppPart> {
        self.parts
            .iter()
            .filter(|p| p.status == MppPartStatus::Settled)
            .collect()
    }

    pub fn failed_parts(&self) -> Vec<&MppPart> {
        self.parts
            .iter()
            .filter(|p| p.status == MppPartStatus::Failed)
            .collect()
    }

    /// Preimage revealed by any settled part
    pub fn preimage(&self) -> Option<PaymentPreimage> {
        self.parts.iter().find_map(|p| p.preimage)
    }
}

/// Manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MppStats {
    pub active_payments: usize,
    pub complete_payments: usize,
    pub failed_payments: usize,
    pub in_flight_parts: usize,
    /// Fees paid by complete payments
    pub total_fees_msat: u64,
}

/// Counts from [`MppPaymentManager::maintenance`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_exclusions: usize,
    pub pruned_hints: usize,
}

struct ValidatedRequest {
    payment_hash: PaymentHash,
    payment_secret: PaymentSecret,
    destination: NodeId,
}

/// State shared between the manager and its part tasks
struct ManagerInner {
    config: MppConfig,
    local_node: NodeId,
    router: Arc<dyn RoutingGraph>,
    dispatcher: Arc<dyn HtlcDispatcher>,
    exclusions: Arc<PathExclusionManager>,
    liquidity: Arc<LiquidityModel>,
    splitter: PaymentSplitter,
    active_payments: RwLock<HashMap<PaymentHash, MppPayment>>,
    cancellations: Mutex<HashMap<PaymentHash, watch::Sender<bool>>>,
    next_part_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Fixed inputs of one part task
#[derive(Clone)]
struct PartTask {
    payment_hash: PaymentHash,
    destination: NodeId,
    index: usize,
    part_id: PartId,
    amount_msat: u64,
    final_hop_payload: Vec<u8>,
}

/// Send-side multi-part payment manager
pub struct MppPaymentManager {
    inner: Arc<ManagerInner>,
}

impl MppPaymentManager {
    pub fn new(
        config: MppConfig,
        local_node: NodeId,
        router: Arc<dyn RoutingGraph>,
        dispatcher: Arc<dyn HtlcDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let exclusions = Arc::new(PathExclusionManager::new(
            config.exclusion.clone(),
            clock.clone(),
        ));
        let liquidity = Arc::new(LiquidityModel::new(config.liquidity.clone(), clock.clone()));
        Self::with_models(config, local_node, router, dispatcher, exclusions, liquidity, clock)
    }

    /// Build a manager around existing exclusion and liquidity state
    pub fn with_models(
        config: MppConfig,
        local_node: NodeId,
        router: Arc<dyn RoutingGraph>,
        dispatcher: Arc<dyn HtlcDispatcher>,
        exclusions: Arc<PathExclusionManager>,
        liquidity: Arc<LiquidityModel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let splitter = PaymentSplitter::new(config.split_limits());
        Self {
            inner: Arc::new(ManagerInner {
                config,
                local_node,
                router,
                dispatcher,
                exclusions,
                liquidity,
                splitter,
                active_payments: RwLock::new(HashMap::new()),
                cancellations: Mutex::new(HashMap::new()),
                next_part_id: AtomicU64::new(1),
                clock,
            }),
        }
    }

    pub fn config(&self) -> &MppConfig {
        &self.inner.config
    }

    pub fn exclusions(&self) -> &Arc<PathExclusionManager> {
        &self.inner.exclusions
    }

    pub fn liquidity(&self) -> &Arc<LiquidityModel> {
        &self.inner.liquidity
    }

    fn validate(&self, request: &PaymentRequest) -> MppResult<ValidatedRequest> {
        if request.amount_msat == 0 {
            return Err(MppError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }
        let payment_hash = PaymentHash::try_from(request.payment_hash.as_slice())?;
        let payment_secret = PaymentSecret::try_from(request.payment_secret.as_slice())?;
        let destination = NodeId::try_from(request.destination.as_slice())?;
        if request.amount_msat < self.inner.config.min_part_size_msat {
            return Err(MppError::InvalidRequest(format!(
                "amount {} msat is below the minimum part size of {} msat",
                request.amount_msat, self.inner.config.min_part_size_msat
            )));
        }
        Ok(ValidatedRequest {
            payment_hash,
            payment_secret,
            destination,
        })
    }

    /// Send a payment and wait for its outcome.
    ///
    /// Returns `Err` only if the request is malformed or the same payment is
    /// already in flight. Routing and settlement failures come back as a
    /// `Failed` snapshot with a reason and every part's result.
    pub async fn send_payment(&self, request: PaymentRequest) -> MppResult<MppPayment> {
        let validated = self.validate(&request)?;
        let payment_hash = validated.payment_hash;
        let amount_msat = request.amount_msat;
        let inner = &self.inner;

        let cancel_rx = {
            let mut active = inner
                .active_payments
                .write()
                .map_err(|_| MppError::LockPoisoned)?;
            let mut cancellations = inner
                .cancellations
                .lock()
                .map_err(|_| MppError::LockPoisoned)?;
            // A cancelled send keeps its entry until its part tasks have joined
            let still_running = active.get(&payment_hash).is_some_and(|p| !p.is_terminal());
            if still_running || cancellations.contains_key(&payment_hash) {
                return Err(MppError::PaymentInProgress {
                    payment_hash: payment_hash.to_hex(),
                });
            }
            active.insert(
                payment_hash,
                MppPayment {
                    payment_hash,
                    payment_secret: validated.payment_secret,
                    total_amount_msat: amount_msat,
                    destination: validated.destination,
                    parts: Vec::new(),
                    status: MppPaymentStatus::Pending,
                    strategy: None,
                    total_fees_msat: 0,
                    created_at_ms: inner.clock.now_millis(),
                    completed_at_ms: None,
                    failure_reason: None,
                },
            );

            let (cancel_tx, cancel_rx) = watch::channel(false);
            cancellations.insert(payment_hash, cancel_tx);
            cancel_rx
        };

        info!(
            "Starting MPP payment {} for {} msat to {}",
            payment_hash,
            amount_msat,
            validated.destination.short_hex()
        );

        // Candidate first hops
        let channels = inner.router.all_channels().await;
        let candidates: Vec<_> = inner
            .liquidity
            .planning_snapshot(&channels)
            .into_iter()
            .filter(|c| c.available_msat > 0)
            .filter(|c| {
                !inner
                    .exclusions
                    .is_channel_excluded_for_amount(c.channel_id, amount_msat.min(c.available_msat))
            })
            .collect();

        let strategy = request.strategy.unwrap_or(inner.config.strategy);
        let plan = match inner.splitter.split(
            amount_msat,
            &candidates,
            strategy,
            inner.liquidity.attempt_stats(),
        ) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Payment {} could not be split: {}", payment_hash, e);
                return inner.finish_payment(payment_hash, Some(format!("split failed: {}", e)));
            }
        };

        let routes = inner.plan_routes(&validated.destination, &plan.parts).await;

        let mut tasks = Vec::with_capacity(plan.parts.len());
        {
            let mut active = inner
                .active_payments
                .write()
                .map_err(|_| MppError::LockPoisoned)?;
            let Some(payment) = active.get_mut(&payment_hash) else {
                drop(active);
                inner.forget_cancellation(&payment_hash);
                return Err(MppError::PaymentNotFound {
                    payment_hash: payment_hash.to_hex(),
                });
            };
            // Cancelled while we were splitting and routing
            if payment.is_terminal() {
                let snapshot = payment.clone();
                drop(active);
                inner.forget_cancellation(&payment_hash);
                return Ok(snapshot);
            }

            payment.strategy = Some(plan.strategy);
            payment.status = MppPaymentStatus::InFlight;
            for (allocation, route) in plan.parts.iter().zip(routes) {
                let part_id = PartId(inner.next_part_id.fetch_add(1, Ordering::Relaxed));
                let mut part = MppPart::new(part_id, allocation.amount_msat);
                part.route = route.clone();
                payment.parts.push(part);

                let payload = FinalHopPayload {
                    amt_to_forward_msat: allocation.amount_msat,
                    outgoing_cltv_value: request.final_cltv_expiry,
                    payment_data: Some(PaymentData::new(validated.payment_secret, amount_msat)),
                };
                tasks.push((
                    PartTask {
                        payment_hash,
                        destination: validated.destination,
                        index: allocation.index,
                        part_id,
                        amount_msat: allocation.amount_msat,
                        final_hop_payload: payload.encode(),
                    },
                    route,
                ));
            }
        }

        info!(
            "Payment {} split into {} parts using {}",
            payment_hash,
            tasks.len(),
            plan.strategy
        );

        let handles: Vec<_> = tasks
            .into_iter()
            .map(|(task, route)| {
                let inner = Arc::clone(&self.inner);
                let cancel_rx = cancel_rx.clone();
                tokio::spawn(async move { inner.run_part(task, route, cancel_rx).await })
            })
            .collect();

        for (index, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!("Part task {} of payment {} aborted: {}", index, payment_hash, e);
                inner.update_part(&payment_hash, index, |part| {
                    part.mark_failed(FailureCode::Unknown(0), format!("part task aborted: {}", e));
                });
            }
        }

        inner.finish_payment(payment_hash, None)
    }

    /// Cancel a payment. Non-terminal parts become `Failed` ("cancelled") and
    /// in-flight tasks stop. Returns `false` if the payment is unknown or
    /// already terminal.
    pub fn cancel_payment(&self, payment_hash: &PaymentHash) -> MppResult<bool> {
        let inner = &self.inner;
        {
            let mut active = inner
                .active_payments
                .write()
                .map_err(|_| MppError::LockPoisoned)?;
            let Some(payment) = active.get_mut(payment_hash) else {
                return Ok(false);
            };
            if payment.is_terminal() {
                return Ok(false);
            }
            for part in payment
                .parts
                .iter_mut()
                .filter(|p| !matches!(p.status, MppPartStatus::Settled | MppPartStatus::Failed))
            {
                part.mark_failed(FailureCode::Cancelled, "cancelled".to_string());
            }
            payment.status = MppPaymentStatus::Failed;
            payment.failure_reason = Some("cancelled".to_string());
            payment.completed_at_ms = Some(inner.clock.now_millis());
        }

        if let Some(cancel_tx) = inner
            .cancellations
            .lock()
            .map_err(|_| MppError::LockPoisoned)?
            .get(payment_hash)
        {
            let _ = cancel_tx.send(true);
        }

        info!("Cancelled payment {}", payment_hash);
        Ok(true)
    }

    pub fn get_payment(&self, payment_hash: &PaymentHash) -> MppResult<Option<MppPayment>> {
        let active = self
            .inner
            .active_payments
            .read()
            .map_err(|_| MppError::LockPoisoned)?;
        Ok(active.get(payment_hash).cloned())
    }

    /// Payments that have not reached a terminal state
    pub fn active_payments(&self) -> MppResult<Vec<MppPayment>> {
        let active = self
            .inner
            .active_payments
            .read()
            .map_err(|_| MppError::LockPoisoned)?;
        Ok(active.values().filter(|p| !p.is_terminal()).cloned().collect())
    }

    pub fn stats(&self) -> MppResult<MppStats> {
        let active = self
            .inner
            .active_payments
            .read()
            .map_err(|_| MppError::LockPoisoned)?;

        let mut stats = MppStats::default();
        for payment in active.values() {
            match payment.status {
                MppPaymentStatus::Pending | MppPaymentStatus::InFlight => {
                    stats.active_payments += 1;
                }
                MppPaymentStatus::Complete => {
                    stats.complete_payments += 1;
                    stats.total_fees_msat += payment.total_fees_msat;
                }
                MppPaymentStatus::Failed => stats.failed_payments += 1,
            }
            stats.in_flight_parts += payment
                .parts
                .iter()
                .filter(|p| p.status == MppPartStatus::InFlight)
                .count();
        }
        Ok(stats)
    }

    /// Drop terminal payments that finished at least `older_than` ago.
    /// Returns how many were removed.
    pub fn prune_finished_payments(&self, older_than: Duration) -> MppResult<usize> {
        let now = self.inner.clock.now_millis();
        let cutoff = older_than.as_millis() as u64;
        let mut active = self
            .inner
            .active_payments
            .write()
            .map_err(|_| MppError::LockPoisoned)?;
        let before = active.len();
        active.retain(|_, payment| match payment.completed_at_ms {
            Some(done) if payment.is_terminal() => now.saturating_sub(done) < cutoff,
            _ => true,
        });
        Ok(before - active.len())
    }

    /// Periodic upkeep: expired exclusions and stale liquidity hints
    pub fn maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired_exclusions: self.inner.exclusions.prune_expired(),
            pruned_hints: self.inner.liquidity.prune_old_hints(),
        };
        debug!(
            "Maintenance removed {} exclusions and {} hints",
            report.expired_exclusions, report.pruned_hints
        );
        report
    }
}

impl ManagerInner {
    fn update_part(
        &self,
        payment_hash: &PaymentHash,
        index: usize,
        update: impl FnOnce(&mut MppPart),
    ) {
        match self.active_payments.write() {
            Ok(mut active) => {
                if let Some(part) = active
                    .get_mut(payment_hash)
                    .and_then(|payment| payment.parts.get_mut(index))
                {
                    update(part);
                }
            }
            Err(_) => error!("Payment table lock poisoned; dropping part update"),
        }
    }

    fn forget_cancellation(&self, payment_hash: &PaymentHash) {
        if let Ok(mut cancellations) = self.cancellations.lock() {
            cancellations.remove(payment_hash);
        }
    }

    fn max_fee_msat(&self, amount_msat: u64) -> u64 {
        self.config.max_fee_msat(amount_msat)
    }

    fn base_constraints(&self) -> RouteConstraints {
        RouteConstraints {
            first_hop: None,
            avoid_channels: self.exclusions.excluded_channels().into_iter().collect(),
            avoid_nodes: self.exclusions.excluded_nodes().into_iter().collect(),
        }
    }

    /// One route per allocation, spreading parts over distinct first hops
    async fn plan_routes(
        &self,
        destination: &NodeId,
        allocations: &[PartAllocation],
    ) -> Vec<Option<Route>> {
        let base = self.base_constraints();
        let mut used_first_hops: HashSet<ShortChannelId> = HashSet::new();
        let mut routes = Vec::with_capacity(allocations.len());

        for allocation in allocations {
            let amount = allocation.amount_msat;
            let max_fee = self.max_fee_msat(amount);

            let mut attempts = Vec::with_capacity(3);
            if let Some(preferred) = allocation.preferred_channel_id {
                if !used_first_hops.contains(&preferred) {
                    attempts.push(base.clone().with_first_hop(preferred));
                }
            }
            let mut disjoint = base.clone();
            disjoint.avoid_channels.extend(used_first_hops.iter().copied());
            attempts.push(disjoint);
            attempts.push(base.clone());

            let mut found = None;
            for constraints in &attempts {
                found = self
                    .router
                    .find_route(&self.local_node, destination, amount, max_fee, constraints)
                    .await;
                if found.is_some() {
                    break;
                }
            }

            if let Some(first_hop) = found.as_ref().and_then(Route::first_hop_channel) {
                used_first_hops.insert(first_hop);
            }
            routes.push(found);
        }

        routes
    }

    /// Send one part until it settles, fails for good, or the payment is
    /// cancelled
    async fn run_part(
        &self,
        task: PartTask,
        initial_route: Option<Route>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let hash = task.payment_hash;
        let short_hash = hash.short_hex();
        let mut route = initial_route;
        let mut avoid_channels: HashSet<ShortChannelId> = HashSet::new();
        let mut retry_count = 0u32;

        loop {
            if *cancel_rx.borrow() {
                self.abandon_part(&task);
                return;
            }

            let (failure, attempted) = match route.take() {
                None => (PartFailure::new(FailureCode::NoRoute, "no route found"), None),
                Some(current) => {
                    self.update_part(&hash, task.index, |part| {
                        part.status = MppPartStatus::InFlight;
                        part.route = Some(current.clone());
                    });
                    debug!(
                        "Part {} of {} in flight: {} msat via {:?}",
                        task.part_id,
                        short_hash,
                        task.amount_msat,
                        current.first_hop_channel()
                    );

                    let request = DispatchRequest {
                        payment_hash: hash,
                        part_id: task.part_id,
                        amount_msat: task.amount_msat,
                        route: current.clone(),
                        final_hop_payload: task.final_hop_payload.clone(),
                    };

                    let outcome = tokio::select! {
                        outcome = self.dispatcher.dispatch(request) => outcome,
                        Ok(()) = cancel_rx.changed() => {
                            debug!("Part {} of {} cancelled in flight", task.part_id, short_hash);
                            self.abandon_part(&task);
                            return;
                        }
                    };

                    match outcome {
                        Ok(preimage) if preimage.payment_hash() == hash => {
                            self.settle_part(&task, &current, preimage);
                            return;
                        }
                        Ok(_) => (
                            PartFailure::new(
                                FailureCode::IncorrectOrUnknownPaymentDetails,
                                "preimage does not match payment hash",
                            ),
                            Some(current),
                        ),
                        Err(failure) => (failure, Some(current)),
                    }
                }
            };

            if let Some(channel) =
                self.record_part_failure(&task, attempted.as_ref(), &failure, retry_count)
            {
                avoid_channels.insert(channel);
            }

            let analysis = analyze_payment_error(
                failure.code,
                task.amount_msat,
                retry_count,
                self.config.base_retry_delay(),
            );
            let can_retry = self.config.auto_retry
                && retry_count < self.config.max_retries_per_part
                && analysis.should_retry()
                && !*cancel_rx.borrow();
            if !can_retry {
                warn!(
                    "Part {} of {} failed for good after {} retries: {} ({})",
                    task.part_id, short_hash, retry_count, failure, analysis.reason
                );
                return;
            }

            retry_count += 1;
            self.update_part(&hash, task.index, |part| {
                part.status = MppPartStatus::Pending;
                part.retry_count = retry_count;
            });
            warn!(
                "Retrying part {} of {} in {:?} (attempt {}): {}",
                task.part_id,
                short_hash,
                analysis.retry_delay,
                retry_count + 1,
                analysis.reason
            );

            tokio::select! {
                _ = tokio::time::sleep(analysis.retry_delay) => {}
                Ok(()) = cancel_rx.changed() => {
                    self.abandon_part(&task);
                    return;
                }
            }

            let mut constraints = self.base_constraints();
            constraints.avoid_channels.extend(avoid_channels.iter().copied());
            route = self
                .router
                .find_route(
                    &self.local_node,
                    &task.destination,
                    task.amount_msat,
                    self.max_fee_msat(task.amount_msat),
                    &constraints,
                )
                .await;
        }
    }

    /// A status written by the task after `cancel_payment` ran must not outlive it
    fn abandon_part(&self, task: &PartTask) {
        self.update_part(&task.payment_hash, task.index, |part| {
            if part.status != MppPartStatus::Settled {
                part.mark_failed(FailureCode::Cancelled, "cancelled".to_string());
            }
        });
    }

    fn settle_part(&self, task: &PartTask, route: &Route, preimage: PaymentPreimage) {
        let now = self.clock.now_millis();
        self.update_part(&task.payment_hash, task.index, |part| {
            part.status = MppPartStatus::Settled;
            part.preimage = Some(preimage);
            part.settled_at_ms = Some(now);
            part.failure_code = None;
            part.failure_reason = None;
        });
        for hop in &route.hops {
            self.exclusions.record_success(hop.short_channel_id);
        }
        if let Some(first_hop) = route.first_hop_channel() {
            self.liquidity.record_success(first_hop, task.amount_msat);
        }
        debug!(
            "Part {} of {} settled ({} msat, fee {})",
            task.part_id,
            task.payment_hash.short_hex(),
            task.amount_msat,
            route.total_fee_msat
        );
    }

    /// Mark the part failed and feed the failure into the models. Returns the
    /// channel the failure was blamed on, if any.
    fn record_part_failure(
        &self,
        task: &PartTask,
        route: Option<&Route>,
        failure: &PartFailure,
        retry_count: u32,
    ) -> Option<ShortChannelId> {
        let reason = failure.to_string();
        self.update_part(&task.payment_hash, task.index, |part| {
            part.mark_failed(failure.code, reason.clone());
        });
        warn!(
            "Part {} of {} failed: {}",
            task.part_id,
            task.payment_hash.short_hex(),
            reason
        );

        let channel = failure
            .failing_channel
            .or_else(|| route.and_then(Route::first_hop_channel))?;

        let carried_msat = route
            .and_then(|r| r.hops.iter().find(|h| h.short_channel_id == channel))
            .map(|hop| hop.amount_msat)
            .unwrap_or(task.amount_msat);

        self.liquidity.record_failure(channel, carried_msat);
        self.exclusions
            .record_failure(channel, failure.code, carried_msat, failure.failing_node);

        let analysis = analyze_payment_error(
            failure.code,
            carried_msat,
            retry_count,
            self.config.base_retry_delay(),
        );
        if let RecommendedAction::Resplit { suggested_amount_msat } = analysis.action {
            self.liquidity.apply_resplit_suggestion(channel, suggested_amount_msat);
        }

        Some(channel)
    }

    /// Compute the aggregate outcome and return the final snapshot
    fn finish_payment(
        &self,
        payment_hash: PaymentHash,
        reason: Option<String>,
    ) -> MppResult<MppPayment> {
        self.forget_cancellation(&payment_hash);

        let mut active = self
            .active_payments
            .write()
            .map_err(|_| MppError::LockPoisoned)?;
        let Some(payment) = active.get_mut(&payment_hash) else {
            return Err(MppError::PaymentNotFound {
                payment_hash: payment_hash.to_hex(),
            });
        };

        payment.total_fees_msat = payment.parts.iter().map(MppPart::fee_msat).sum();

        // Already failed by cancel_payment
        if payment.is_terminal() {
            return Ok(payment.clone());
        }

        payment.completed_at_ms = Some(self.clock.now_millis());
        let all_settled = !payment.parts.is_empty()
            && payment
                .parts
                .iter()
                .all(|p| p.status == MppPartStatus::Settled);

        if reason.is_none() && all_settled {
            payment.status = MppPaymentStatus::Complete;
            info!(
                "Payment {} complete: {} msat in {} parts, {} msat fees",
                payment_hash,
                payment.total_amount_msat,
                payment.parts.len(),
                payment.total_fees_msat
            );
        } else {
            let reason = reason.unwrap_or_else(|| failure_summary(payment));
            payment.status = MppPaymentStatus::Failed;
            payment.failure_reason = Some(reason.clone());
            info!("Payment {} failed: {}", payment_hash, reason);
        }

        Ok(payment.clone())
    }
}

/// Why a payment whose parts have all returned did not complete
fn failure_summary(payment: &MppPayment) -> String {
    let total = payment.parts.len();
    let settled_msat = payment.settled_amount_msat();
    let failed = payment.failed_parts();
    match failed.first() {
        Some(first) => format!(
            "{} of {} parts failed ({} msat settled): {}",
            failed.len(),
            total,
            settled_msat,
            first.failure_reason.as_deref().unwrap_or("no reason recorded")
        ),
        None => {
            let unresolved = payment
                .parts
                .iter()
                .filter(|p| !matches!(p.status, MppPartStatus::Settled | MppPartStatus::Failed))
                .count();
            format!(
                "{} of {} parts left unresolved ({} msat settled)",
                unresolved, total, settled_msat
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::router::{GraphChannel, RouteHop};
    use crate::util::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const PREIMAGE: [u8; 32] = [7u8; 32];

    fn destination() -> NodeId {
        NodeId::new([3u8; 33])
    }

    /// Every local channel reaches the destination directly
    struct DirectRouter {
        channels: Vec<GraphChannel>,
    }

    #[async_trait]
    impl RoutingGraph for DirectRouter {
        async fn find_route(
            &self,
            _source: &NodeId,
            destination: &NodeId,
            amount_msat: u64,
            _max_fee_msat: u64,
            constraints: &RouteConstraints,
        ) -> Option<Route> {
            let channel = self.channels.iter().find(|c| {
                constraints.first_hop.map_or(true, |f| f == c.short_channel_id)
                    && !constraints.avoid_channels.contains(&c.short_channel_id)
                    && c.max_htlc_msat() >= amount_msat
            })?;
            Some(Route {
                hops: vec![RouteHop {
                    node_id: *destination,
                    short_channel_id: channel.short_channel_id,
                    amount_msat,
                    fee_msat: 0,
                    cltv_expiry_delta: 40,
                }],
                total_fee_msat: 0,
                total_amount_msat: amount_msat,
                total_cltv_delta: 0,
            })
        }

        async fn all_channels(&self) -> Vec<GraphChannel> {
            self.channels.clone()
        }
    }

    /// Fails every attempt over the listed channels
    struct ScriptedDispatcher {
        failing: HashSet<ShortChannelId>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HtlcDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, request: DispatchRequest) -> Result<PaymentPreimage, PartFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let channel = request.route.first_hop_channel().unwrap();
            if self.failing.contains(&channel) {
                Err(PartFailure::new(FailureCode::TemporaryChannelFailure, "no liquidity")
                    .at_channel(channel))
            } else {
                Ok(PaymentPreimage::new(PREIMAGE))
            }
        }
    }

    fn channels(ids: &[u64]) -> Vec<GraphChannel> {
        ids.iter()
            .map(|id| GraphChannel {
                short_channel_id: ShortChannelId(*id),
                capacity_sat: 1_000,
                htlc_maximum_msat: None,
            })
            .collect()
    }

    fn manager(
        channel_ids: &[u64],
        failing: &[u64],
        config: MppConfig,
    ) -> (MppPaymentManager, Arc<ScriptedDispatcher>) {
        let dispatcher = Arc::new(ScriptedDispatcher {
            failing: failing.iter().map(|id| ShortChannelId(*id)).collect(),
            calls: AtomicUsize::new(0),
        });
        let manager = MppPaymentManager::new(
            config,
            NodeId::new([2u8; 33]),
            Arc::new(DirectRouter {
                channels: channels(channel_ids),
            }),
            dispatcher.clone(),
            Arc::new(ManualClock::default()),
        );
        (manager, dispatcher)
    }

    fn test_config() -> MppConfig {
        MppConfig {
            base_retry_delay_ms: 0,
            ..MppConfig::default()
        }
    }

    fn request(amount_msat: u64) -> PaymentRequest {
        let hash = PaymentPreimage::new(PREIMAGE).payment_hash();
        PaymentRequest::new(
            hash.as_bytes().to_vec(),
            vec![9u8; 32],
            amount_msat,
            destination().as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_validation_rejects_bad_requests() {
        let (manager, _) = manager(&[1], &[], test_config());
        let mut bad = request(100_000);
        bad.payment_hash = vec![0u8; 31];
        assert!(matches!(
            manager.validate(&bad),
            Err(MppError::InvalidIdentifier(IdentifierError::InvalidLength { expected: 32, .. }))
        ));

        let mut bad = request(100_000);
        bad.destination = vec![2u8; 32];
        assert!(manager.validate(&bad).is_err());

        assert!(matches!(manager.validate(&request(0)), Err(MppError::InvalidRequest(_))));
        assert!(matches!(manager.validate(&request(9_999)), Err(MppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_payment_completes_across_parts() {
        let (manager, _) = manager(&[1, 2, 3], &[], test_config());
        let payment = manager
            .send_payment(request(1_500_000).with_strategy(SplitStrategy::Equal))
            .await
            .unwrap();

        assert_eq!(payment.status, MppPaymentStatus::Complete);
        assert!(payment.parts.len() >= 2);
        assert_eq!(payment.settled_amount_msat(), 1_500_000);
        assert_eq!(payment.preimage(), Some(PaymentPreimage::new(PREIMAGE)));
        assert!(payment.completed_at_ms.is_some());

        let stats = manager.stats().unwrap();
        assert_eq!(stats.complete_payments, 1);
        assert_eq!(stats.active_payments, 0);
    }

    #[tokio::test]
    async fn test_failed_part_is_retried_on_another_channel() {
        let (manager, dispatcher) = manager(&[1, 2, 3], &[1], test_config());
        let payment = manager
            .send_payment(request(600_000).with_strategy(SplitStrategy::Equal))
            .await
            .unwrap();

        assert_eq!(payment.status, MppPaymentStatus::Complete);
        assert!(dispatcher.calls.load(Ordering::SeqCst) > payment.parts.len());
        assert!(manager.exclusions().is_channel_excluded(ShortChannelId(1)));
    }

    #[tokio::test]
    async fn test_duplicate_terminal_payment_can_be_resent() {
        let (manager, _) = manager(&[1], &[], test_config());
        manager.send_payment(request(100_000)).await.unwrap();
        let again = manager.send_payment(request(100_000)).await.unwrap();
        assert_eq!(again.status, MppPaymentStatus::Complete);
    }

    #[tokio::test]
    async fn test_split_failure_is_reported_in_snapshot() {
        let (manager, _) = manager(&[1], &[], test_config());
        // 1000 sat channel cannot carry 2000 sat
        let payment = manager.send_payment(request(2_000_000)).await.unwrap();
        assert_eq!(payment.status, MppPaymentStatus::Failed);
        assert!(payment.failure_reason.unwrap().contains("split failed"));
        assert!(payment.parts.is_empty());
    }

    #[tokio::test]
    async fn test_resplit_hint_limits_next_plan() {
        let config = MppConfig {
            max_parts: 1,
            auto_retry: false,
            ..test_config()
        };
        let (manager, dispatcher) = manager(&[1], &[1], config);

        let first = manager.send_payment(request(600_000)).await.unwrap();
        assert_eq!(first.status, MppPaymentStatus::Failed);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        // TemporaryChannelFailure suggests half the failed amount
        let planned = manager.liquidity().planning_snapshot(&channels(&[1]));
        assert_eq!(planned[0].available_msat, 300_000);

        // The raw estimate alone (599_999) would still have tried 400k
        let second = manager.send_payment(request(400_000)).await.unwrap();
        assert_eq!(second.status, MppPaymentStatus::Failed);
        assert!(second.failure_reason.unwrap().contains("split failed"));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1, "nothing was dispatched");
    }

    #[test]
    fn test_finish_reports_unresolved_parts() {
        let (manager, _) = manager(&[1], &[], test_config());
        let validated = manager.validate(&request(300_000)).unwrap();
        let hash = validated.payment_hash;

        let mut settled = MppPart::new(PartId(1), 100_000);
        settled.status = MppPartStatus::Settled;
        let payment = MppPayment {
            payment_hash: hash,
            payment_secret: validated.payment_secret,
            total_amount_msat: 300_000,
            destination: validated.destination,
            parts: vec![
                settled,
                MppPart::new(PartId(2), 100_000),
                MppPart::new(PartId(3), 100_000),
            ],
            status: MppPaymentStatus::InFlight,
            strategy: None,
            total_fees_msat: 0,
            created_at_ms: 0,
            completed_at_ms: None,
            failure_reason: None,
        };
        manager.inner.active_payments.write().unwrap().insert(hash, payment);

        let finished = manager.inner.finish_payment(hash, None).unwrap();
        assert_eq!(finished.status, MppPaymentStatus::Failed);
        assert_eq!(
            finished.failure_reason.as_deref(),
            Some("2 of 3 parts left unresolved (100000 msat settled)")
        );
    }

    #[test]
    fn test_failure_summary_names_first_failed_part() {
        let (manager, _) = manager(&[1], &[], test_config());
        let validated = manager.validate(&request(200_000)).unwrap();
        let mut failed = MppPart::new(PartId(2), 100_000);
        failed.mark_failed(FailureCode::TemporaryChannelFailure, "no liquidity".to_string());
        let payment = MppPayment {
            payment_hash: validated.payment_hash,
            payment_secret: validated.payment_secret,
            total_amount_msat: 200_000,
            destination: validated.destination,
            parts: vec![MppPart::new(PartId(1), 100_000), failed],
            status: MppPaymentStatus::InFlight,
            strategy: None,
            total_fees_msat: 0,
            created_at_ms: 0,
            completed_at_ms: None,
            failure_reason: None,
        };

        assert_eq!(
            failure_summary(&payment),
            "1 of 2 parts failed (0 msat settled): no liquidity"
        );
    }

    #[tokio::test]
    async fn test_prune_and_cancel_unknown() {
        let (manager, _) = manager(&[1], &[], test_config());
        let payment = manager.send_payment(request(100_000)).await.unwrap();

        assert!(!manager.cancel_payment(&payment.payment_hash).unwrap());
        assert!(!manager.cancel_payment(&PaymentHash::new([0; 32])).unwrap());

        assert_eq!(manager.prune_finished_payments(Duration::ZERO).unwrap(), 1);
        assert!(manager.get_payment(&payment.payment_hash).unwrap().is_none());
    }
}
