//! Lightning multi-part payment components
//!
//! Leaves first: [`wire`] encodes what goes on the wire, [`exclusion`] and
//! [`liquidity`] remember how channels behaved, [`splitter`] decides how to
//! divide an amount, [`multipath`] sends and [`collector`] receives.

pub mod collector;
pub mod exclusion;
pub mod failure;
pub mod liquidity;
pub mod multipath;
pub mod payment;
pub mod router;
pub mod splitter;
pub mod wire;

pub use collector::{
    CollectorError, CollectorResult, HtlcAction, IncomingHtlc, MppPaymentCollector,
    PendingMppPayment, ReceivedPart, RejectReason,
};
pub use exclusion::{FailedPathInfo, PathExclusionManager};
pub use failure::{
    analyze_payment_error, retry_delay, ErrorAnalysis, FailureCode, FailureSeverity,
    RecommendedAction,
};
pub use liquidity::{AttemptStats, ChannelLiquidity, LiquidityHint, LiquidityModel};
pub use multipath::{
    MaintenanceReport, MppError, MppPart, MppPartStatus, MppPayment, MppPaymentManager,
    MppPaymentStatus, MppResult, MppStats, PaymentRequest,
};
pub use payment::{
    DispatchRequest, HtlcDispatcher, HtlcId, IdentifierError, NodeId, PartFailure, PartId,
    PaymentHash, PaymentPreimage, PaymentSecret, ShortChannelId,
};
pub use router::{
    ChannelInfo, GraphChannel, GraphRouter, NetworkGraph, Route, RouteConstraints, RouteHop,
    RoutingGraph,
};
pub use splitter::{
    optimal_part_count, PartAllocation, PaymentSplitter, SplitAlgorithm, SplitError, SplitLimits,
    SplitPlan, SplitResult, SplitStrategy,
};
pub use wire::{
    decode_big_size, encode_big_size, DecodeError, DecodeResult, FinalHopPayload, PaymentData,
    TlvRecord, TlvStream,
};
