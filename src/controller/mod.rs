//! Controller module for dbcluster-operator.
//!
//! Contains the reconciliation loop, the rolling-update dependency graph,
//! the deployment updater, the dependency probe cache, and the periodic
//! status syncer.

// Shared modules
pub mod context;
pub mod error;

// Reconcile path
pub mod component;
pub mod deployment_updater;
pub mod installer;
pub mod reconciler;

// Status path
pub mod conditions;
pub mod deploy_status;
pub mod endpoint_cache;
pub mod runner;
pub mod status_syncer;
