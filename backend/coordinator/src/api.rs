//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthUser, TokenVerifier};
use crate::donations::{Coordinator, StatusChange, StatusUpdate};
use crate::errors::{AppError, Result};
use crate::lifecycle::DonationStatus;
use crate::models::{FoodDonation, Location, NewDonation, Role};

pub struct ApiState {
    pub coordinator: Coordinator,
    pub tokens: TokenVerifier,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/donations", get(list_pending).post(create_donation))
        .route("/donations/:id", get(get_donation))
        .route("/donations/:id/accept", post(accept_donation))
        .route("/donations/:id/reject", post(reject_donation))
        .route("/donations/:id/reviews", post(add_review))
        .route("/donation-history", get(donation_history))
        .route("/active-donation", get(active_donation))
        .route("/update-status/:id", put(update_status))
        .route("/update-delivery-status/:id", post(update_delivery_status))
        .route("/incoming-redistributions", get(incoming_redistributions))
        .route("/redistribution-history", get(redistribution_history))
        .route("/accept-redistribution/:id", post(accept_redistribution))
        .route(
            "/update-redistribution-status/:id/delivered",
            post(mark_redistribution_delivered),
        )
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub message: String,
    pub data: T,
}

fn respond<T: Serialize>(message: &str, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        message: message.to_string(),
        data,
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuery {
    pub volunteer_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBody {
    pub volunteer_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ReviewBody {
    pub rating: i64,
    pub comment: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusBody {
    pub status: String,
    pub otp: Option<String>,
    pub remaining_quantity: Option<f64>,
    pub current_location: Option<Location>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryBody {
    pub remaining_quantity: Option<f64>,
    pub current_location: Option<Location>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBody {
    pub current_location: Option<Location>,
}

#[derive(Serialize)]
pub struct OtpIssued {
    pub otp: String,
    pub donation: FoodDonation,
}

const VOLUNTEER: &[Role] = &[Role::Volunteer];

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /donations`
pub async fn create_donation(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(body): Json<NewDonation>,
) -> Result<impl IntoResponse> {
    let restaurant = auth.require(&[Role::Restaurant])?;
    let donation = state.coordinator.create_donation(&restaurant, body).await?;
    Ok((
        StatusCode::CREATED,
        respond("Food donation created successfully", donation),
    ))
}

/// `GET /donations?volunteerId=`
///
/// Pending donations, newest first. Without `volunteerId` the caller is used.
pub async fn list_pending(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Query(query): Query<PendingQuery>,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    let volunteer_id = query.volunteer_id.unwrap_or(volunteer.id);
    let donations = state.coordinator.list_pending(&volunteer_id).await?;
    Ok(respond("Pending food donations fetched successfully", donations))
}

/// `GET /donations/:id`
pub async fn get_donation(
    State(state): State<Arc<ApiState>>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let donation = state.coordinator.get(&id).await?;
    Ok(respond("Food donation fetched successfully", donation))
}

/// `POST /donations/:id/accept`
pub async fn accept_donation(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<AcceptBody>,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    let volunteer_id = body
        .volunteer_id
        .ok_or_else(|| AppError::invalid("volunteerId is required"))?;
    if volunteer_id != volunteer.id {
        return Err(AppError::Forbidden(
            "Volunteers can only accept donations for themselves".to_string(),
        ));
    }
    let donation = state.coordinator.accept(&id, &volunteer_id).await?;
    Ok(respond("Food donation accepted successfully", donation))
}

/// `POST /donations/:id/reject`
pub async fn reject_donation(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    state.coordinator.reject(&id, &volunteer.id).await?;
    Ok(respond("Food donation rejected successfully", ()))
}

/// `POST /donations/:id/reviews`
pub async fn add_review(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<impl IntoResponse> {
    let ngo = auth.require(&[Role::Ngo])?;
    let donation = state
        .coordinator
        .add_review(&id, &ngo, body.rating, &body.comment)
        .await?;
    Ok(respond("Review added successfully", donation))
}

/// `GET /donation-history`
pub async fn donation_history(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    let donations = state.coordinator.history(&volunteer.id).await?;
    Ok(respond("Donation history fetched successfully", donations))
}

/// `GET /active-donation`
pub async fn active_donation(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    let donation = state.coordinator.active(&volunteer.id).await?;
    Ok(respond("Active donation fetched successfully", donation))
}

/// `PUT /update-status/:id`
///
/// Arrival returns the freshly issued OTP alongside the donation.
pub async fn update_status(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<impl IntoResponse> {
    auth.require(VOLUNTEER)?;
    let target: DonationStatus = body.status.parse()?;
    let change = StatusChange {
        target,
        otp: body.otp,
        remaining_quantity: body.remaining_quantity,
        current_location: body.current_location,
    };
    let response = match state.coordinator.update_status(&id, change).await? {
        StatusUpdate::OtpIssued { otp, donation } => respond(
            "OTP sent successfully",
            serde_json::to_value(OtpIssued { otp, donation })?,
        ),
        StatusUpdate::Updated(donation) => respond(
            "Food donation status updated successfully",
            serde_json::to_value(donation)?,
        ),
    };
    Ok(response)
}

/// `POST /update-delivery-status/:id`
pub async fn update_delivery_status(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<DeliveryBody>,
) -> Result<impl IntoResponse> {
    auth.require(VOLUNTEER)?;
    let remaining = body
        .remaining_quantity
        .ok_or_else(|| AppError::invalid("remainingQuantity is required"))?;
    let donation = state
        .coordinator
        .deliver(&id, remaining, body.current_location)
        .await?;
    Ok(respond("Delivery status updated successfully", donation))
}

/// `GET /incoming-redistributions`
pub async fn incoming_redistributions(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
) -> Result<impl IntoResponse> {
    auth.require(VOLUNTEER)?;
    let records = state.coordinator.incoming_redistributions().await?;
    Ok(respond("Incoming redistributions fetched successfully", records))
}

/// `GET /redistribution-history`
pub async fn redistribution_history(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    let records = state.coordinator.redistribution_history(&volunteer.id).await?;
    Ok(respond("Redistribution history fetched successfully", records))
}

/// `POST /accept-redistribution/:id`
pub async fn accept_redistribution(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    body: Option<Json<LocationBody>>,
) -> Result<impl IntoResponse> {
    let volunteer = auth.require(VOLUNTEER)?;
    let current_location = body.and_then(|Json(b)| b.current_location);
    let record = state
        .coordinator
        .accept_redistribution(&id, &volunteer, current_location)
        .await?;
    Ok(respond("Redistribution accepted successfully", record))
}

/// `POST /update-redistribution-status/:id/delivered`
pub async fn mark_redistribution_delivered(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.require(VOLUNTEER)?;
    let record = state.coordinator.mark_redistribution_delivered(&id).await?;
    Ok(respond("Redistribution marked as delivered", record))
}
