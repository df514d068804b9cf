//! Seam for the (external) automatic transaction generator.
//!
//! The random transaction driver lives in the supervising process; the
//! station core only needs to start and stop it at the lifecycle points
//! the session controller dictates (connection failure, shutdown,
//! template reload).

use async_trait::async_trait;

/// Hook installed by the supervisor to couple a transaction driver to a
/// station's lifecycle.
#[async_trait]
pub trait TransactionGenerator: Send + Sync {
    /// Begin generating transactions.
    async fn start(&self);

    /// Stop generating transactions and stop the ones it started.
    async fn stop(&self);
}
