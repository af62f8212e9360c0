//! Long-running background task that expires donations whose food went
//! off before anyone delivered it.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::Result;
use crate::lifecycle::DonationEvent;

/// Sweep every `interval` until `shutdown` fires. The caller decides where it runs.
pub async fn run(pool: SqlitePool, interval: Duration, shutdown: CancellationToken) {
    info!("Expiry sweeper starting, every {}s", interval.as_secs());

    loop {
        match sweep_once(&pool, Utc::now().timestamp()).await {
            Ok(0) => {}
            Ok(n) => info!("Expired {n} donations"),
            Err(e) => error!("Expiry sweep error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Expiry sweeper stopped");
}

/// Perform a single sweep. Returns how many donations were expired.
pub async fn sweep_once(pool: &SqlitePool, now: i64) -> Result<usize> {
    let overdue = db::overdue_donations(pool, now).await?;
    if overdue.is_empty() {
        return Ok(0);
    }

    let mut conn = pool.acquire().await?;
    let mut expired = 0;
    for (id, status) in overdue {
        let next = match status.apply(DonationEvent::Expire) {
            Ok(next) => next,
            Err(e) => {
                warn!("Skipping donation {id}: {e}");
                continue;
            }
        };
        // A volunteer may have moved it on since the scan; that is fine.
        if db::transition_donation(&mut conn, &id, status, next, now).await? {
            expired += 1;
        }
    }
    Ok(expired)
}
