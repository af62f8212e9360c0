//! # Lifecycle
//!
//! Finite-state machines for the two tracked entities. Every status write in
//! the service is derived from [`DonationStatus::apply`] or
//! [`RedistributionStatus::accept`]; nothing stores a caller-supplied status
//! verbatim.
//!
//! ```text
//! Pending ──accept──► Accepted ──request-arrival──► Arrival for Pick Up
//!                                                     │  ▲  (re-issue OTP)
//!                                                     │  └──┘
//!                                          confirm-pickup (OTP)
//!                                                     ▼
//!                                            Out for Delivery
//!                                     deliver │              │ deliver (partial)
//!                                             ▼              ▼
//!                                        Delivered     Redistributed
//!                                                            │ redistribution accepted
//!                                                            ▼
//!                                                  Redistribute Accepted
//!
//! Pending | Accepted | Arrival for Pick Up ──expire──► Expired
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};

/// Status of a [`FoodDonation`](crate::models::FoodDonation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum DonationStatus {
    Pending,
    Accepted,
    #[serde(rename = "Arrival for Pick Up")]
    #[sqlx(rename = "Arrival for Pick Up")]
    ArrivalForPickUp,
    #[serde(rename = "Out for Delivery")]
    #[sqlx(rename = "Out for Delivery")]
    OutForDelivery,
    Delivered,
    Expired,
    Redistributed,
    #[serde(rename = "Redistribute Accepted")]
    #[sqlx(rename = "Redistribute Accepted")]
    RedistributeAccepted,
}

/// Something that happens to a donation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonationEvent {
    Accept,
    RequestArrival,
    ConfirmPickup,
    /// `partial` is true when some food is left over for a second volunteer.
    Deliver { partial: bool },
    Expire,
    RedistributionAccepted,
}

impl DonationStatus {
    pub const ALL: [DonationStatus; 8] = [
        Self::Pending,
        Self::Accepted,
        Self::ArrivalForPickUp,
        Self::OutForDelivery,
        Self::Delivered,
        Self::Expired,
        Self::Redistributed,
        Self::RedistributeAccepted,
    ];

    /// Statuses in which a volunteer is holding the donation.
    pub const ACTIVE: [DonationStatus; 3] = [
        Self::Accepted,
        Self::ArrivalForPickUp,
        Self::OutForDelivery,
    ];

    /// Statuses an expiry date can still take effect in.
    pub const EXPIRABLE: [DonationStatus; 3] =
        [Self::Pending, Self::Accepted, Self::ArrivalForPickUp];

    /// Statuses in which an NGO may leave a review.
    pub const REVIEWABLE: [DonationStatus; 3] = [
        Self::Delivered,
        Self::Redistributed,
        Self::RedistributeAccepted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Accepted => "Accepted",
            Self::ArrivalForPickUp => "Arrival for Pick Up",
            Self::OutForDelivery => "Out for Delivery",
            Self::Delivered => "Delivered",
            Self::Expired => "Expired",
            Self::Redistributed => "Redistributed",
            Self::RedistributeAccepted => "Redistribute Accepted",
        }
    }

    /// The transition table. Any `(status, event)` pair not listed is a conflict.
    pub fn apply(self, event: DonationEvent) -> Result<DonationStatus> {
        use DonationEvent as E;
        use DonationStatus as S;

        let next = match (self, event) {
            (S::Pending, E::Accept) => S::Accepted,
            (S::Accepted | S::ArrivalForPickUp, E::RequestArrival) => S::ArrivalForPickUp,
            (S::ArrivalForPickUp, E::ConfirmPickup) => S::OutForDelivery,
            (S::OutForDelivery, E::Deliver { partial: false }) => S::Delivered,
            (S::OutForDelivery, E::Deliver { partial: true }) => S::Redistributed,
            (S::Pending | S::Accepted | S::ArrivalForPickUp, E::Expire) => S::Expired,
            (S::Redistributed, E::RedistributionAccepted) => S::RedistributeAccepted,
            (from, event) => {
                return Err(AppError::conflict(format!(
                    "Cannot {} a donation that is {}",
                    event.verb(),
                    from
                )))
            }
        };
        Ok(next)
    }
}

impl DonationEvent {
    /// Map a status requested through `update-status` onto the event that produces it.
    pub fn for_target(target: DonationStatus, partial: bool) -> Option<Self> {
        match target {
            DonationStatus::ArrivalForPickUp => Some(Self::RequestArrival),
            DonationStatus::OutForDelivery => Some(Self::ConfirmPickup),
            DonationStatus::Delivered => Some(Self::Deliver { partial }),
            _ => None,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::RequestArrival => "request pick-up arrival for",
            Self::ConfirmPickup => "confirm pick-up of",
            Self::Deliver { .. } => "deliver",
            Self::Expire => "expire",
            Self::RedistributionAccepted => "accept a redistribution of",
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::invalid(format!("Unknown donation status: {s}")))
    }
}

/// Status of a [`Redistribution`](crate::models::Redistribution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum RedistributionStatus {
    Pending,
    Accepted,
    Delivered,
    Redistributed,
    #[serde(rename = "Redistribute Accepted")]
    #[sqlx(rename = "Redistribute Accepted")]
    RedistributeAccepted,
}

impl RedistributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Accepted => "Accepted",
            Self::Delivered => "Delivered",
            Self::Redistributed => "Redistributed",
            Self::RedistributeAccepted => "Redistribute Accepted",
        }
    }

    /// Only an open (`Redistributed`) record can be claimed by a second volunteer.
    pub fn accept(self) -> Result<RedistributionStatus> {
        match self {
            Self::Redistributed => Ok(Self::RedistributeAccepted),
            other => Err(AppError::conflict(format!(
                "Redistribution is {other} and can no longer be accepted"
            ))),
        }
    }
}

impl fmt::Display for RedistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────
// Quantities
// ─────────────────────────────────────────────────────────

/// Coerce a free-form stored quantity ("20", " 12.5 ") to a number.
/// Anything that is not a plain finite number yields `None`.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|q| q.is_finite())
}

/// A delivery is partial when strictly between nothing and everything was left over.
/// An unparseable stored quantity never produces a partial delivery.
pub fn is_partial_delivery(stored_quantity: &str, remaining: f64) -> bool {
    match parse_quantity(stored_quantity) {
        Some(quantity) => remaining > 0.0 && remaining < quantity,
        None => false,
    }
}
