//! Domain records served by the API.
//!
//! Rows come out of [`crate::db`] in their storage shape and are converted
//! into these types; field names serialize as camelCase for the web client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::lifecycle::{DonationStatus, RedistributionStatus};

/// Roles issued by the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    User,
    Ngo,
    Volunteer,
    Restaurant,
}

/// A user resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub phone_number: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl User {
    /// Last position the user reported, if both coordinates are known.
    pub fn last_location(&self) -> Option<Location> {
        Some(Location {
            latitude: self.latitude?,
            longitude: self.longitude?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn validate(self) -> Result<Self> {
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(AppError::invalid(format!(
                "Invalid location ({}, {})",
                self.latitude, self.longitude
            )));
        }
        Ok(self)
    }
}

/// NGO feedback on a completed donation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub ngo: String,
    pub rating: i64,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Single review slot kept from the first version of the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyReview {
    pub rating: Option<i64>,
    pub comment: Option<String>,
}

/// A batch of surplus food listed by a restaurant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodDonation {
    pub id: String,
    pub food_name: String,
    /// Free-form; see [`crate::lifecycle::parse_quantity`].
    pub quantity: String,
    pub food_type: String,
    pub expiry_date: DateTime<Utc>,
    pub schedule_pick_up: DateTime<Utc>,
    pub restaurant_pincode: Option<i64>,
    pub restaurant_name: Option<String>,
    pub restaurant_user: String,
    pub accepted_by_id: Option<String>,
    pub accepted_by: Option<String>,
    pub status: DonationStatus,
    #[serde(skip)]
    pub otp: Option<String>,
    #[serde(skip)]
    pub otp_expiry: Option<DateTime<Utc>>,
    /// Spawned redistribution ids, oldest first.
    pub redistributions: Vec<String>,
    pub review: Option<LegacyReview>,
    pub reviews: Vec<Review>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unconsumed remainder of a donation, waiting for or carried by a second volunteer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redistribution {
    pub id: String,
    pub food_id: String,
    pub food_name: String,
    pub volunteer_name: String,
    pub volunteer_id: String,
    pub accepted_by_id: Option<String>,
    pub remaining_quantity: f64,
    pub expiry_date: DateTime<Utc>,
    pub restaurant: String,
    pub current_location: Location,
    pub status: RedistributionStatus,
    pub created_at: DateTime<Utc>,
}

/// A redistribution with display names resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedistributionView {
    #[serde(flatten)]
    pub redistribution: Redistribution,
    pub restaurant_name: Option<String>,
}

/// Fields a restaurant supplies when listing food.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDonation {
    pub food_name: String,
    pub quantity: String,
    pub food_type: String,
    pub expiry_date: DateTime<Utc>,
    pub schedule_pick_up: DateTime<Utc>,
    pub restaurant_pincode: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn donation() -> FoodDonation {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        FoodDonation {
            id: "d1".into(),
            food_name: "Rice".into(),
            quantity: "20".into(),
            food_type: "veg".into(),
            expiry_date: at,
            schedule_pick_up: at,
            restaurant_pincode: Some(560001),
            restaurant_name: Some("Annapurna".into()),
            restaurant_user: "r1".into(),
            accepted_by_id: None,
            accepted_by: None,
            status: DonationStatus::Pending,
            otp: Some("123456".into()),
            otp_expiry: Some(at),
            redistributions: vec![],
            review: None,
            reviews: vec![],
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn donation_serializes_camel_case_without_otp() {
        let json = serde_json::to_value(donation()).unwrap();
        assert_eq!(json["foodName"], "Rice");
        assert_eq!(json["restaurantUser"], "r1");
        assert_eq!(json["status"], "Pending");
        assert!(json.get("otp").is_none());
        assert!(json.get("otpExpiry").is_none());
    }

    #[test]
    fn redistribution_view_flattens() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let view = RedistributionView {
            redistribution: Redistribution {
                id: "x".into(),
                food_id: "d1".into(),
                food_name: "Rice".into(),
                volunteer_name: "Asha".into(),
                volunteer_id: "v1".into(),
                accepted_by_id: None,
                remaining_quantity: 5.0,
                expiry_date: at,
                restaurant: "r1".into(),
                current_location: Location {
                    latitude: 12.97,
                    longitude: 77.59,
                },
                status: RedistributionStatus::Redistributed,
                created_at: at,
            },
            restaurant_name: Some("Annapurna".into()),
        };
        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json["foodId"], "d1");
        assert_eq!(json["remainingQuantity"], 5.0);
        assert_eq!(json["currentLocation"]["latitude"], 12.97);
        assert_eq!(json["restaurantName"], "Annapurna");
        assert_eq!(json["status"], "Redistributed");
    }

    #[test]
    fn location_bounds() {
        let ok = Location {
            latitude: -33.86,
            longitude: 151.2,
        };
        assert_eq!(ok.validate().unwrap(), ok);
        let bad = Location {
            latitude: 91.0,
            longitude: 0.0,
        };
        assert!(matches!(bad.validate(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn last_location_needs_both_coordinates() {
        let mut user = User {
            id: "v1".into(),
            name: "Asha".into(),
            role: Role::Volunteer,
            phone_number: None,
            latitude: Some(1.0),
            longitude: None,
        };
        assert_eq!(user.last_location(), None);
        user.longitude = Some(2.0);
        assert_eq!(
            user.last_location(),
            Some(Location {
                latitude: 1.0,
                longitude: 2.0
            })
        );
    }
}
