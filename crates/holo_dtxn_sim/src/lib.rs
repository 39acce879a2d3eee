//! In-process cluster simulator for `holo_dtxn`.
//!
//! Runs partitions, replicas and initiators as tokio tasks, drives a seeded
//! counter workload through them, and checks afterwards that every replica of
//! a partition executed the same transactions in the same order.

pub mod cluster;
pub mod engine;
pub mod history;
pub mod workload;
