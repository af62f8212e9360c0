//! Redistribution sub-lifecycle: leftovers from a partial delivery waiting
//! for, or carried by, a second volunteer.

use chrono::Utc;
use tracing::{info, warn};

use crate::db;
use crate::donations::Coordinator;
use crate::errors::{AppError, Result};
use crate::lifecycle::{DonationEvent, RedistributionStatus};
use crate::models::{Location, RedistributionView, User};

fn redistribution_not_found() -> AppError {
    AppError::not_found("Redistribution not found")
}

impl Coordinator {
    /// Open records any volunteer may claim, newest first.
    pub async fn incoming_redistributions(&self) -> Result<Vec<RedistributionView>> {
        let mut conn = self.pool.acquire().await?;
        db::redistributions_with_status(&mut conn, RedistributionStatus::Redistributed).await
    }

    /// Records the volunteer spawned or picked up.
    pub async fn redistribution_history(&self, volunteer_id: &str) -> Result<Vec<RedistributionView>> {
        let mut conn = self.pool.acquire().await?;
        db::redistributions_involving(&mut conn, volunteer_id).await
    }

    /// Claim an open redistribution. The parent donation follows along when it
    /// still exists and is in a state that allows it.
    pub async fn accept_redistribution(
        &self,
        redistribution_id: &str,
        volunteer: &User,
        current_location: Option<Location>,
    ) -> Result<RedistributionView> {
        let location = current_location
            .or_else(|| volunteer.last_location())
            .ok_or_else(|| AppError::invalid("currentLocation is required"))?
            .validate()?;

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // The claim is the first statement so the write lock is taken before any read.
        let claimed = db::claim_redistribution(
            &mut tx,
            redistribution_id,
            RedistributionStatus::Redistributed,
            RedistributionStatus::RedistributeAccepted,
            &volunteer.id,
            location,
        )
        .await?;

        let record = db::get_redistribution(&mut tx, redistribution_id)
            .await?
            .ok_or_else(redistribution_not_found)?
            .redistribution;
        if !claimed {
            record.status.accept()?;
            return Err(AppError::conflict(
                "Redistribution was accepted by another volunteer",
            ));
        }

        match db::get_donation(&mut tx, &record.food_id).await? {
            Some(parent) => match parent.status.apply(DonationEvent::RedistributionAccepted) {
                Ok(status) => {
                    if !db::transition_donation(&mut tx, &parent.id, parent.status, status, now)
                        .await?
                    {
                        warn!("Donation {} changed while accepting redistribution {redistribution_id}", parent.id);
                    }
                }
                Err(e) => warn!("Donation {} left as is: {e}", parent.id),
            },
            None => warn!(
                "Redistribution {redistribution_id} refers to missing donation {}",
                record.food_id
            ),
        }

        let updated = db::get_redistribution(&mut tx, redistribution_id)
            .await?
            .ok_or_else(redistribution_not_found)?;
        tx.commit().await?;
        info!(
            "Redistribution {redistribution_id}: {} -> {} by volunteer {}",
            RedistributionStatus::Redistributed,
            RedistributionStatus::RedistributeAccepted,
            volunteer.id
        );
        Ok(updated)
    }

    /// Close out a redistribution regardless of where it was. The parent donation is not touched.
    pub async fn mark_redistribution_delivered(&self, redistribution_id: &str) -> Result<RedistributionView> {
        let mut conn = self.pool.acquire().await?;
        if !db::set_redistribution_status(&mut conn, redistribution_id, RedistributionStatus::Delivered)
            .await?
        {
            return Err(redistribution_not_found());
        }
        info!("Redistribution {redistribution_id} delivered");
        db::get_redistribution(&mut conn, redistribution_id)
            .await?
            .ok_or_else(redistribution_not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::insert_donation_row;
    use std::sync::Arc;

    use crate::donations::testing::{assert_one_winner, harness, racing_harness, Harness};
    use crate::lifecycle::DonationStatus;

    const SPOT: Location = Location {
        latitude: 12.9352,
        longitude: 77.6245,
    };

    async fn volunteer(h: &Harness, id: &str) -> User {
        let mut conn = h.coordinator.pool.acquire().await.unwrap();
        db::find_user(&mut conn, id).await.unwrap().unwrap()
    }

    /// A donation delivered partially by v1, leaving an open redistribution.
    async fn leftover(h: &Harness) -> String {
        insert_donation_row(&h.coordinator.pool, "d", "10", DonationStatus::OutForDelivery, Some("v1"), 1).await;
        let d = h.coordinator.deliver("d", 4.0, None).await.unwrap();
        d.redistributions[0].clone()
    }

    #[tokio::test]
    async fn incoming_lists_only_open_records() {
        let h = harness().await;
        let id = leftover(&h).await;

        let open = h.coordinator.incoming_redistributions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].redistribution.id, id);
        assert_eq!(open[0].restaurant_name.as_deref(), Some("Annapurna"));

        h.coordinator.mark_redistribution_delivered(&id).await.unwrap();
        assert!(h.coordinator.incoming_redistributions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accept_moves_record_and_parent() {
        let h = harness().await;
        let id = leftover(&h).await;
        let v2 = volunteer(&h, "v2").await;

        let view = h.coordinator.accept_redistribution(&id, &v2, Some(SPOT)).await.unwrap();
        let r = view.redistribution;
        assert_eq!(r.status, RedistributionStatus::RedistributeAccepted);
        assert_eq!(r.accepted_by_id.as_deref(), Some("v2"));
        assert_eq!(r.current_location, SPOT);

        let parent = h.coordinator.get("d").await.unwrap();
        assert_eq!(parent.status, DonationStatus::RedistributeAccepted);

        let err = h.coordinator.accept_redistribution(&id, &v2, Some(SPOT)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn accept_survives_missing_parent() {
        let h = harness().await;
        let id = leftover(&h).await;
        sqlx::query("DELETE FROM food_donations WHERE id = 'd'")
            .execute(&h.coordinator.pool)
            .await
            .unwrap();

        let v2 = volunteer(&h, "v2").await;
        let view = h.coordinator.accept_redistribution(&id, &v2, Some(SPOT)).await.unwrap();
        assert_eq!(view.redistribution.status, RedistributionStatus::RedistributeAccepted);
    }

    #[tokio::test]
    async fn accept_rejects_bad_input() {
        let h = harness().await;
        let id = leftover(&h).await;
        let v2 = volunteer(&h, "v2").await;

        let err = h
            .coordinator
            .accept_redistribution("missing", &v2, Some(SPOT))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Redistribution not found");

        let nowhere = Location {
            latitude: 120.0,
            longitude: 0.0,
        };
        let err = h
            .coordinator
            .accept_redistribution(&id, &v2, Some(nowhere))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        // Without a body location the volunteer's last known position is used.
        let view = h.coordinator.accept_redistribution(&id, &v2, None).await.unwrap();
        assert_eq!(view.redistribution.current_location, v2.last_location().unwrap());
    }

    #[tokio::test]
    async fn history_covers_originator_and_acceptor() {
        let h = harness().await;
        let id = leftover(&h).await;
        let v2 = volunteer(&h, "v2").await;

        assert!(h.coordinator.redistribution_history("v2").await.unwrap().is_empty());
        h.coordinator.accept_redistribution(&id, &v2, Some(SPOT)).await.unwrap();

        for who in ["v1", "v2"] {
            let history = h.coordinator.redistribution_history(who).await.unwrap();
            assert_eq!(history.len(), 1, "{who}");
            assert_eq!(history[0].redistribution.id, id);
        }
    }

    #[tokio::test]
    async fn mark_delivered_ignores_prior_status() {
        let h = harness().await;
        let id = leftover(&h).await;

        for _ in 0..2 {
            let view = h.coordinator.mark_redistribution_delivered(&id).await.unwrap();
            assert_eq!(view.redistribution.status, RedistributionStatus::Delivered);
        }
        // The parent keeps its own status.
        assert_eq!(h.coordinator.get("d").await.unwrap().status, DonationStatus::Redistributed);

        let err = h.coordinator.mark_redistribution_delivered("missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_volunteers_get_one_acceptance() {
        let (h, _dir) = racing_harness().await;
        let pool = h.coordinator.pool.clone();
        let volunteers = [volunteer(&h, "v1").await, volunteer(&h, "v2").await];
        let coordinator = Arc::new(h.coordinator);

        for round in 0..25 {
            let id = format!("d{round}");
            insert_donation_row(&pool, &id, "10", DonationStatus::OutForDelivery, Some("v1"), round).await;
            let record = coordinator.deliver(&id, 4.0, Some(SPOT)).await.unwrap().redistributions[0].clone();

            let tasks = volunteers.clone().map(|v| {
                let c = coordinator.clone();
                let record = record.clone();
                tokio::spawn(async move { c.accept_redistribution(&record, &v, Some(SPOT)).await })
            });
            let mut results = Vec::new();
            for task in tasks {
                results.push(task.await.unwrap());
            }
            assert_one_winner(&results);

            let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
            assert_eq!(winner.redistribution.status, RedistributionStatus::RedistributeAccepted);
            assert_eq!(coordinator.get(&id).await.unwrap().status, DonationStatus::RedistributeAccepted);
        }
    }
}
