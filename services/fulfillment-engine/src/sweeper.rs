//! Background sweep that expires overdue signing sessions.

use crate::database::Database;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Spawn the expiry loop. Sessions whose deadline passed flip to
/// `EXPIRED` and their magic links stop resolving; couriers may then
/// re-create a session for the same milestone.
pub fn spawn(db: Arc<Database>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            match db.expire_due_sessions(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("expired {} overdue signing sessions", count),
                Err(e) => error!("session expiry sweep failed: {}", e),
            }
        }
    })
}
