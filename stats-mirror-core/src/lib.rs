#![doc = "stats-mirror-core: core logic library for stats-mirror."]

//! This crate contains the synchronisation logic, data models and remote client
//! for mirroring the statistical catalog. Storage backends live in the CLI crate;
//! everything here talks to storage through the traits in [`contract`].
//!
//! # Usage
//! Run [`synchronise::synchronise_tree`] for the metric and region trees, then
//! [`observations::synchronise_observations`] for values.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod error;
pub mod memory;
pub mod model;
pub mod observations;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod synchronise;
