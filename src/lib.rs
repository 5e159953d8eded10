//! Meridian — an event-driven trading pipeline.
//!
//! Five long-lived services (data, strategy, risk, execution,
//! reconciliation) communicate over ordered, resumable streams and share a
//! relational store of orders, positions, and account snapshots. The risk
//! layer bounds portfolio heat, the execution layer submits idempotent
//! orders with mandatory protective stops, and the reconciler continuously
//! audits local bookkeeping against venue reality.

pub mod bus;
pub mod config;
pub mod events;
pub mod exchange;
pub mod indicators;
pub mod models;
pub mod order_ids;
pub mod risk;
pub mod services;
pub mod store;
