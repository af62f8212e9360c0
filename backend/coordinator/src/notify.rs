//! Announcing leftover food to other volunteers.
//!
//! The lifecycle calls [`RedistributionNotifier::notify`] once a partial
//! delivery has been committed. Push, SMS or pub-sub fan-out plugs in here
//! without the engine changing.

use async_trait::async_trait;
use tracing::info;

use crate::errors::Result;
use crate::models::Redistribution;

#[async_trait]
pub trait RedistributionNotifier: Send + Sync {
    async fn notify(&self, record: &Redistribution) -> Result<()>;
}

/// Default notifier: volunteers discover new records by polling
/// `GET /incoming-redistributions`, so this only logs.
pub struct LogNotifier;

#[async_trait]
impl RedistributionNotifier for LogNotifier {
    async fn notify(&self, record: &Redistribution) -> Result<()> {
        info!(
            "Redistribution {} open: {} x {} near ({:.4}, {:.4})",
            record.id,
            record.remaining_quantity,
            record.food_name,
            record.current_location.latitude,
            record.current_location.longitude
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::errors::AppError;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub seen: Mutex<Vec<String>>,
        pub fail: bool,
    }

    #[async_trait]
    impl RedistributionNotifier for RecordingNotifier {
        async fn notify(&self, record: &Redistribution) -> Result<()> {
            self.seen.lock().unwrap().push(record.id.clone());
            if self.fail {
                return Err(AppError::Internal("push service down".into()));
            }
            Ok(())
        }
    }
}
