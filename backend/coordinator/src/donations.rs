//! # Donation lifecycle
//!
//! [`Coordinator`] owns every operation that moves a [`FoodDonation`]
//! through its states. Each write is a conditional update keyed on the status
//! the decision was made against, so a concurrent request that got there
//! first turns into a `Conflict` instead of a silent overwrite.
//!
//! | Operation | Event |
//! |---|---|
//! | [`Coordinator::accept`] | `Accept` |
//! | [`Coordinator::update_status`] → arrival | `RequestArrival` (issues OTP) |
//! | [`Coordinator::update_status`] → out for delivery | `ConfirmPickup` (consumes OTP) |
//! | [`Coordinator::deliver`] | `Deliver { partial }` (may spawn a redistribution) |
//!
//! Redistribution operations live in [`crate::redistribution`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::{error, info};
use uuid::Uuid;

use crate::db;
use crate::errors::{AppError, Result};
use crate::lifecycle::{is_partial_delivery, DonationEvent, DonationStatus, RedistributionStatus};
use crate::models::{FoodDonation, Location, NewDonation, Redistribution, Role, User};
use crate::notify::RedistributionNotifier;
use crate::otp;
use crate::sms::SmsSender;

pub struct Coordinator {
    pub pool: SqlitePool,
    pub sms: Arc<dyn SmsSender>,
    pub notifier: Arc<dyn RedistributionNotifier>,
    pub otp_ttl: Duration,
    pub default_country_code: String,
}

/// A volunteer's request to move a donation to `target`.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub target: DonationStatus,
    pub otp: Option<String>,
    pub remaining_quantity: Option<f64>,
    pub current_location: Option<Location>,
}

#[derive(Debug, Clone)]
pub enum StatusUpdate {
    /// Arrival recorded; the code is returned to the caller as well as sent out.
    OtpIssued { otp: String, donation: FoodDonation },
    Updated(FoodDonation),
}

const ONE_AT_A_TIME: &str =
    "You can only accept one donation at a time. Complete the current donation first.";
const NO_LONGER_PENDING: &str =
    "This food donation has already been accepted or is no longer pending.";
const CHANGED_UNDERNEATH: &str = "Donation was updated by another request; reload and retry";

fn donation_not_found() -> AppError {
    AppError::not_found("Food donation not found")
}

fn volunteer_not_found() -> AppError {
    AppError::not_found("Volunteer not found")
}

impl Coordinator {
    async fn require_volunteer(
        &self,
        conn: &mut sqlx::SqliteConnection,
        volunteer_id: &str,
    ) -> Result<User> {
        let user = db::find_user(conn, volunteer_id)
            .await?
            .ok_or_else(volunteer_not_found)?;
        if user.role != Role::Volunteer {
            return Err(AppError::invalid(format!("User {volunteer_id} is not a volunteer")));
        }
        Ok(user)
    }

    /// `POST /donations`: a restaurant lists surplus food.
    pub async fn create_donation(&self, restaurant: &User, new: NewDonation) -> Result<FoodDonation> {
        for (field, value) in [
            ("foodName", &new.food_name),
            ("quantity", &new.quantity),
            ("foodType", &new.food_type),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::invalid(format!("{field} is required")));
            }
        }
        let now = Utc::now();
        if new.expiry_date <= now {
            return Err(AppError::invalid("expiryDate must be in the future"));
        }

        let id = Uuid::new_v4().to_string();
        let mut conn = self.pool.acquire().await?;
        db::insert_donation(&mut conn, &id, &new, restaurant, now.timestamp()).await?;
        info!("Donation {id} listed by restaurant {}", restaurant.id);

        db::get_donation(&mut conn, &id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("donation {id} vanished after insert")))
    }

    pub async fn get(&self, donation_id: &str) -> Result<FoodDonation> {
        let mut conn = self.pool.acquire().await?;
        db::get_donation(&mut conn, donation_id)
            .await?
            .ok_or_else(donation_not_found)
    }

    /// All pending donations, newest first.
    pub async fn list_pending(&self, volunteer_id: &str) -> Result<Vec<FoodDonation>> {
        let mut conn = self.pool.acquire().await?;
        self.require_volunteer(&mut conn, volunteer_id).await?;
        db::donations_with_status(&mut conn, DonationStatus::Pending).await
    }

    /// Claim a pending donation. At most one active donation per volunteer.
    pub async fn accept(&self, donation_id: &str, volunteer_id: &str) -> Result<FoodDonation> {
        let mut conn = self.pool.acquire().await?;
        let volunteer = self.require_volunteer(&mut conn, volunteer_id).await?;
        let donation = db::get_donation(&mut conn, donation_id)
            .await?
            .ok_or_else(donation_not_found)?;

        if db::active_donation_for(&mut conn, volunteer_id).await?.is_some() {
            return Err(AppError::conflict(ONE_AT_A_TIME));
        }
        donation
            .status
            .apply(DonationEvent::Accept)
            .map_err(|_| AppError::conflict(NO_LONGER_PENDING))?;

        let now = Utc::now().timestamp();
        match db::claim_donation(&mut conn, donation_id, &volunteer, now).await {
            Ok(true) => {}
            Ok(false) => return Err(AppError::conflict(NO_LONGER_PENDING)),
            Err(e) if e.is_unique_violation() => return Err(AppError::conflict(ONE_AT_A_TIME)),
            Err(e) => return Err(e),
        }
        info!("Donation {donation_id}: Pending -> Accepted by volunteer {volunteer_id}");

        db::get_donation(&mut conn, donation_id)
            .await?
            .ok_or_else(donation_not_found)
    }

    /// Dismiss a donation from one volunteer's view. Never changes its status:
    /// another volunteer may still accept it.
    pub async fn reject(&self, donation_id: &str, volunteer_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        db::get_donation(&mut conn, donation_id)
            .await?
            .ok_or_else(donation_not_found)?;
        info!("Donation {donation_id} dismissed by volunteer {volunteer_id}");
        Ok(())
    }

    /// Every donation the volunteer has accepted, newest first.
    pub async fn history(&self, volunteer_id: &str) -> Result<Vec<FoodDonation>> {
        let mut conn = self.pool.acquire().await?;
        self.require_volunteer(&mut conn, volunteer_id).await?;
        db::donations_accepted_by(&mut conn, volunteer_id).await
    }

    /// The donation the volunteer is currently carrying. `NotFound` when idle.
    pub async fn active(&self, volunteer_id: &str) -> Result<FoodDonation> {
        let mut conn = self.pool.acquire().await?;
        self.require_volunteer(&mut conn, volunteer_id).await?;
        db::active_donation_for(&mut conn, volunteer_id)
            .await?
            .ok_or_else(|| AppError::not_found("No active donation found"))
    }

    /// `PUT /update-status/{id}`. Only statuses reachable by a volunteer's own
    /// action can be requested; everything goes through the transition table.
    pub async fn update_status(&self, donation_id: &str, change: StatusChange) -> Result<StatusUpdate> {
        let donation = self.get(donation_id).await?;

        let partial = change.target == DonationStatus::Delivered
            && change
                .remaining_quantity
                .is_some_and(|r| is_partial_delivery(&donation.quantity, r));
        let event = DonationEvent::for_target(change.target, partial).ok_or_else(|| {
            AppError::invalid(format!("Status '{}' cannot be set directly", change.target))
        })?;

        match event {
            DonationEvent::RequestArrival => self.request_arrival(donation).await,
            DonationEvent::ConfirmPickup => {
                let otp = change
                    .otp
                    .ok_or_else(|| AppError::invalid("OTP is required to start the delivery"))?;
                self.confirm_pickup(donation, &otp)
                    .await
                    .map(StatusUpdate::Updated)
            }
            DonationEvent::Deliver { .. } => self
                .deliver(
                    donation_id,
                    change.remaining_quantity.unwrap_or(0.0),
                    change.current_location,
                )
                .await
                .map(StatusUpdate::Updated),
            other => Err(AppError::Internal(format!("unexpected event {other:?}"))),
        }
    }

    /// Record the volunteer's arrival, store a fresh OTP and send it to both
    /// sides of the handoff.
    async fn request_arrival(&self, donation: FoodDonation) -> Result<StatusUpdate> {
        let next = donation.status.apply(DonationEvent::RequestArrival)?;
        let now = Utc::now();
        let issued = otp::issue(now, self.otp_ttl);

        let mut conn = self.pool.acquire().await?;
        let stored = db::store_otp(
            &mut conn,
            &donation.id,
            donation.status,
            next,
            &issued.code,
            issued.expires_at.timestamp(),
            now.timestamp(),
        )
        .await?;
        if !stored {
            return Err(AppError::conflict(CHANGED_UNDERNEATH));
        }
        info!("Donation {}: {} -> {next}, OTP issued", donation.id, donation.status);

        let mut recipients = Vec::new();
        for id in donation
            .accepted_by_id
            .iter()
            .chain(std::iter::once(&donation.restaurant_user))
        {
            if let Some(user) = db::find_user(&mut conn, id).await? {
                recipients.push(user);
            }
        }
        let updated = db::get_donation(&mut conn, &donation.id)
            .await?
            .ok_or_else(donation_not_found)?;
        drop(conn);

        tokio::spawn(otp::dispatch(
            self.sms.clone(),
            recipients,
            otp::render_message(&issued.code, &updated),
            self.default_country_code.clone(),
        ));

        Ok(StatusUpdate::OtpIssued {
            otp: issued.code,
            donation: updated,
        })
    }

    /// Check the OTP and start the delivery. A failed check leaves the status alone.
    async fn confirm_pickup(&self, donation: FoodDonation, submitted: &str) -> Result<FoodDonation> {
        let next = donation.status.apply(DonationEvent::ConfirmPickup)?;
        let now = Utc::now();
        otp::verify(donation.otp.as_deref(), donation.otp_expiry, submitted, now)?;

        let mut conn = self.pool.acquire().await?;
        let consumed = db::consume_otp(
            &mut conn,
            &donation.id,
            donation.status,
            next,
            submitted.trim(),
            now.timestamp(),
        )
        .await?;
        if !consumed {
            return Err(AppError::InvalidOtp);
        }
        info!("Donation {}: {} -> {next}", donation.id, donation.status);

        db::get_donation(&mut conn, &donation.id)
            .await?
            .ok_or_else(donation_not_found)
    }

    /// Finish a delivery. When `0 < remaining < quantity` the leftover becomes a
    /// [`Redistribution`] and the donation is marked `Redistributed`; otherwise
    /// it is `Delivered`. The new record, its link and the status flip commit
    /// together or not at all.
    pub async fn deliver(
        &self,
        donation_id: &str,
        remaining_quantity: f64,
        current_location: Option<Location>,
    ) -> Result<FoodDonation> {
        if !remaining_quantity.is_finite() {
            return Err(AppError::invalid("remainingQuantity must be a number"));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Take the write lock before the first read.
        let claimed =
            db::touch_donation(&mut tx, donation_id, DonationStatus::OutForDelivery, now.timestamp())
                .await?;

        let donation = db::get_donation(&mut tx, donation_id)
            .await?
            .ok_or_else(donation_not_found)?;
        let partial = is_partial_delivery(&donation.quantity, remaining_quantity);
        let next = donation.status.apply(DonationEvent::Deliver { partial })?;
        if !claimed {
            return Err(AppError::conflict(CHANGED_UNDERNEATH));
        }

        let mut spawned = None;
        if partial {
            let volunteer_id = donation.accepted_by_id.as_deref().ok_or_else(volunteer_not_found)?;
            let volunteer = db::find_user(&mut tx, volunteer_id)
                .await?
                .ok_or_else(volunteer_not_found)?;
            let location = current_location
                .or_else(|| volunteer.last_location())
                .ok_or_else(|| AppError::invalid("currentLocation is required for a partial delivery"))?
                .validate()?;

            let record = Redistribution {
                id: Uuid::new_v4().to_string(),
                food_id: donation.id.clone(),
                food_name: donation.food_name.clone(),
                volunteer_name: volunteer.name.clone(),
                volunteer_id: volunteer.id.clone(),
                accepted_by_id: None,
                remaining_quantity,
                expiry_date: donation.expiry_date,
                restaurant: donation.restaurant_user.clone(),
                current_location: location,
                status: RedistributionStatus::Redistributed,
                created_at: now,
            };
            db::insert_redistribution(&mut tx, &record).await?;
            db::link_redistribution(&mut tx, &donation.id, &record.id).await?;
            spawned = Some(record);
        }

        if !db::transition_donation(&mut tx, donation_id, donation.status, next, now.timestamp())
            .await?
        {
            return Err(AppError::conflict(CHANGED_UNDERNEATH));
        }
        let updated = db::get_donation(&mut tx, donation_id)
            .await?
            .ok_or_else(donation_not_found)?;
        tx.commit().await?;
        info!("Donation {donation_id}: {} -> {next}", donation.status);

        if let Some(record) = spawned {
            info!(
                "Redistribution {} created for donation {donation_id} ({remaining_quantity} left)",
                record.id
            );
            if let Err(e) = self.notifier.notify(&record).await {
                error!("Failed to notify volunteers about redistribution {}: {e}", record.id);
            }
        }
        Ok(updated)
    }

    /// `POST /donations/{id}/reviews`: NGO feedback on a finished donation.
    pub async fn add_review(
        &self,
        donation_id: &str,
        ngo: &User,
        rating: i64,
        comment: &str,
    ) -> Result<FoodDonation> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::invalid("rating must be between 1 and 5"));
        }
        let comment = comment.trim();
        if comment.is_empty() {
            return Err(AppError::invalid("comment is required"));
        }

        let mut conn = self.pool.acquire().await?;
        let donation = db::get_donation(&mut conn, donation_id)
            .await?
            .ok_or_else(donation_not_found)?;
        if !DonationStatus::REVIEWABLE.contains(&donation.status) {
            return Err(AppError::conflict(format!(
                "A donation that is {} cannot be reviewed yet",
                donation.status
            )));
        }

        db::insert_review(&mut conn, donation_id, &ngo.id, rating, comment, Utc::now().timestamp())
            .await?;
        info!("Donation {donation_id} reviewed by NGO {} ({rating}/5)", ngo.id);

        db::get_donation(&mut conn, donation_id)
            .await?
            .ok_or_else(donation_not_found)
    }
}
