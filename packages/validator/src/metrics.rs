//! Prometheus metrics for the bridge validator.
//!
//! Served from the bus HTTP server's /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Session metrics
    pub static ref SESSIONS_TOTAL: CounterVec = register_counter_vec!(
        "validator_sessions_total",
        "Consensus sessions entered, by destination chain and role",
        &["dest_chain", "role"]
    )
    .unwrap();

    pub static ref PROPOSALS_REJECTED: CounterVec = register_counter_vec!(
        "validator_proposals_rejected_total",
        "Proposals rejected, by reason",
        &["reason"]
    )
    .unwrap();

    // Pipeline metrics
    pub static ref DEPOSITS_OBSERVED: CounterVec = register_counter_vec!(
        "validator_deposits_observed_total",
        "Deposit events observed, by source chain",
        &["chain"]
    )
    .unwrap();

    pub static ref SIGNATURES_TOTAL: CounterVec = register_counter_vec!(
        "validator_signatures_total",
        "Threshold signatures produced, by destination chain",
        &["dest_chain"]
    )
    .unwrap();

    pub static ref FINALIZED_TOTAL: CounterVec = register_counter_vec!(
        "validator_deposits_finalized_total",
        "Deposits finalized, by source chain",
        &["chain"]
    )
    .unwrap();

    // Queue sizes
    pub static ref DEPOSITS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "validator_deposits_by_status",
        "Deposit rows in the local store, by status",
        &["status"]
    )
    .unwrap();

    // Chain sync metrics
    pub static ref LAST_OBSERVED_HEIGHT: GaugeVec = register_gauge_vec!(
        "validator_last_observed_height",
        "Last confirmed height seen per chain",
        &["chain"]
    )
    .unwrap();

    pub static ref CURRENT_EPOCH: Gauge = register_gauge!(
        "validator_current_epoch",
        "Current session epoch counter"
    )
    .unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "validator_up",
        "Whether the validator loop is running"
    )
    .unwrap();
}
