//! Database layer: migrations, row mapping and every query the service runs.
//!
//! Status writes are conditional (`... WHERE status = ?`) so that two requests
//! racing on the same record cannot both win; callers treat `false` from a
//! transition helper as a lost race.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::Result;
use crate::lifecycle::{DonationStatus, RedistributionStatus};
use crate::models::{
    FoodDonation, LegacyReview, Location, NewDonation, Redistribution, RedistributionView,
    Review, User,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

pub fn to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DonationRow {
    pub id: String,
    pub food_name: String,
    pub quantity: String,
    pub food_type: String,
    pub expiry_date: i64,
    pub schedule_pick_up: i64,
    pub restaurant_pincode: Option<i64>,
    pub restaurant_name: Option<String>,
    pub restaurant_user: String,
    pub accepted_by_id: Option<String>,
    pub accepted_by: Option<String>,
    pub status: DonationStatus,
    pub otp: Option<String>,
    pub otp_expiry: Option<i64>,
    pub review_rating: Option<i64>,
    pub review_comment: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DonationRow {
    fn into_donation(self, redistributions: Vec<String>, reviews: Vec<Review>) -> FoodDonation {
        let review = (self.review_rating.is_some() || self.review_comment.is_some()).then(|| {
            LegacyReview {
                rating: self.review_rating,
                comment: self.review_comment,
            }
        });
        FoodDonation {
            id: self.id,
            food_name: self.food_name,
            quantity: self.quantity,
            food_type: self.food_type,
            expiry_date: to_datetime(self.expiry_date),
            schedule_pick_up: to_datetime(self.schedule_pick_up),
            restaurant_pincode: self.restaurant_pincode,
            restaurant_name: self.restaurant_name,
            restaurant_user: self.restaurant_user,
            accepted_by_id: self.accepted_by_id,
            accepted_by: self.accepted_by,
            status: self.status,
            otp: self.otp,
            otp_expiry: self.otp_expiry.map(to_datetime),
            redistributions,
            review,
            reviews,
            created_at: to_datetime(self.created_at),
            updated_at: to_datetime(self.updated_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RedistributionRow {
    pub id: String,
    pub food_id: String,
    pub food_name: String,
    pub volunteer_name: String,
    pub volunteer_id: String,
    pub accepted_by_id: Option<String>,
    pub remaining_quantity: f64,
    pub expiry_date: i64,
    pub restaurant: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: RedistributionStatus,
    pub created_at: i64,
    pub restaurant_name: Option<String>,
}

impl From<RedistributionRow> for RedistributionView {
    fn from(row: RedistributionRow) -> Self {
        RedistributionView {
            redistribution: Redistribution {
                id: row.id,
                food_id: row.food_id,
                food_name: row.food_name,
                volunteer_name: row.volunteer_name,
                volunteer_id: row.volunteer_id,
                accepted_by_id: row.accepted_by_id,
                remaining_quantity: row.remaining_quantity,
                expiry_date: to_datetime(row.expiry_date),
                restaurant: row.restaurant,
                current_location: Location {
                    latitude: row.latitude,
                    longitude: row.longitude,
                },
                status: row.status,
                created_at: to_datetime(row.created_at),
            },
            restaurant_name: row.restaurant_name,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReviewRow {
    ngo: String,
    rating: i64,
    comment: String,
    created_at: i64,
}

const DONATION_COLUMNS: &str = r#"
    id, food_name, quantity, food_type, expiry_date, schedule_pick_up,
    restaurant_pincode, restaurant_name, restaurant_user, accepted_by_id, accepted_by,
    status, otp, otp_expiry, review_rating, review_comment, created_at, updated_at
"#;

const REDISTRIBUTION_SELECT: &str = r#"
    SELECT r.id, r.food_id, r.food_name, r.volunteer_name, r.volunteer_id, r.accepted_by_id,
           r.remaining_quantity, r.expiry_date, r.restaurant, r.latitude, r.longitude,
           r.status, r.created_at, u.name AS restaurant_name
    FROM   redistributions r
    LEFT   JOIN users u ON u.id = r.restaurant
"#;

/// SQL list literal for a fixed set of statuses, e.g. `('Pending', 'Accepted')`.
fn status_list(statuses: &[DonationStatus]) -> String {
    let quoted: Vec<String> = statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("({})", quoted.join(", "))
}

// ─────────────────────────────────────────────────────────
// Users (identity store)
// ─────────────────────────────────────────────────────────

pub async fn find_user(conn: &mut SqliteConnection, id: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, name, role, phone_number, latitude, longitude FROM users WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(user)
}

// ─────────────────────────────────────────────────────────
// Donation reads
// ─────────────────────────────────────────────────────────

async fn attach_children(conn: &mut SqliteConnection, row: DonationRow) -> Result<FoodDonation> {
    let links: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT redistribution_id
        FROM   donation_redistributions
        WHERE  donation_id = ?1
        ORDER  BY position ASC
        "#,
    )
    .bind(&row.id)
    .fetch_all(&mut *conn)
    .await?;

    let reviews = sqlx::query_as::<_, ReviewRow>(
        r#"
        SELECT ngo, rating, comment, created_at
        FROM   donation_reviews
        WHERE  donation_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(&row.id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|r| Review {
        ngo: r.ngo,
        rating: r.rating,
        comment: r.comment,
        created_at: to_datetime(r.created_at),
    })
    .collect();

    Ok(row.into_donation(links.into_iter().map(|(id,)| id).collect(), reviews))
}

async fn attach_all(conn: &mut SqliteConnection, rows: Vec<DonationRow>) -> Result<Vec<FoodDonation>> {
    let mut donations = Vec::with_capacity(rows.len());
    for row in rows {
        donations.push(attach_children(conn, row).await?);
    }
    Ok(donations)
}

/// Load a donation with its redistribution links and reviews.
pub async fn get_donation(conn: &mut SqliteConnection, id: &str) -> Result<Option<FoodDonation>> {
    let sql = format!("SELECT {DONATION_COLUMNS} FROM food_donations WHERE id = ?1");
    let row = sqlx::query_as::<_, DonationRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(Some(attach_children(conn, row).await?)),
        None => Ok(None),
    }
}

/// All donations in `status`, newest first.
pub async fn donations_with_status(
    conn: &mut SqliteConnection,
    status: DonationStatus,
) -> Result<Vec<FoodDonation>> {
    let sql = format!(
        "SELECT {DONATION_COLUMNS} FROM food_donations WHERE status = ?1 \
         ORDER BY created_at DESC, rowid DESC"
    );
    let rows = sqlx::query_as::<_, DonationRow>(&sql)
        .bind(status)
        .fetch_all(&mut *conn)
        .await?;
    attach_all(conn, rows).await
}

/// Every donation a volunteer has ever accepted, newest first.
pub async fn donations_accepted_by(
    conn: &mut SqliteConnection,
    volunteer_id: &str,
) -> Result<Vec<FoodDonation>> {
    let sql = format!(
        "SELECT {DONATION_COLUMNS} FROM food_donations WHERE accepted_by_id = ?1 \
         ORDER BY created_at DESC, rowid DESC"
    );
    let rows = sqlx::query_as::<_, DonationRow>(&sql)
        .bind(volunteer_id)
        .fetch_all(&mut *conn)
        .await?;
    attach_all(conn, rows).await
}

/// The in-progress donation held by a volunteer, if any.
pub async fn active_donation_for(
    conn: &mut SqliteConnection,
    volunteer_id: &str,
) -> Result<Option<FoodDonation>> {
    let sql = format!(
        "SELECT {DONATION_COLUMNS} FROM food_donations \
         WHERE accepted_by_id = ?1 AND status IN {} LIMIT 1",
        status_list(&DonationStatus::ACTIVE)
    );
    let row = sqlx::query_as::<_, DonationRow>(&sql)
        .bind(volunteer_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(Some(attach_children(conn, row).await?)),
        None => Ok(None),
    }
}

/// Donations past their expiry date whose status still allows expiry.
pub async fn overdue_donations(
    pool: &SqlitePool,
    now: i64,
) -> Result<Vec<(String, DonationStatus)>> {
    let sql = format!(
        "SELECT id, status FROM food_donations WHERE expiry_date < ?1 AND status IN {}",
        status_list(&DonationStatus::EXPIRABLE)
    );
    let rows = sqlx::query_as::<_, (String, DonationStatus)>(&sql)
        .bind(now)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Donation writes
// ─────────────────────────────────────────────────────────

pub async fn insert_donation(
    conn: &mut SqliteConnection,
    id: &str,
    new: &NewDonation,
    restaurant: &User,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO food_donations
            (id, food_name, quantity, food_type, expiry_date, schedule_pick_up,
             restaurant_pincode, restaurant_name, restaurant_user, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
        "#,
    )
    .bind(id)
    .bind(new.food_name.trim())
    .bind(new.quantity.trim())
    .bind(new.food_type.trim())
    .bind(new.expiry_date.timestamp())
    .bind(new.schedule_pick_up.timestamp())
    .bind(new.restaurant_pincode)
    .bind(&restaurant.name)
    .bind(&restaurant.id)
    .bind(DonationStatus::Pending)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move a donation from `from` to `to`. Returns `false` if it was no longer in `from`.
pub async fn transition_donation(
    conn: &mut SqliteConnection,
    id: &str,
    from: DonationStatus,
    to: DonationStatus,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE food_donations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Bump `updated_at` on a donation that is still in `status`. Run as the first
/// statement of a transaction so the write lock is held before anything is read.
pub async fn touch_donation(
    conn: &mut SqliteConnection,
    id: &str,
    status: DonationStatus,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query("UPDATE food_donations SET updated_at = ?1 WHERE id = ?2 AND status = ?3")
        .bind(now)
        .bind(id)
        .bind(status)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

/// Claim a pending donation for a volunteer. A unique-index violation means the
/// volunteer already holds another active donation.
pub async fn claim_donation(
    conn: &mut SqliteConnection,
    id: &str,
    volunteer: &User,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE food_donations
        SET    status = ?1, accepted_by_id = ?2, accepted_by = ?3, updated_at = ?4
        WHERE  id = ?5 AND status = ?6
        "#,
    )
    .bind(DonationStatus::Accepted)
    .bind(&volunteer.id)
    .bind(&volunteer.name)
    .bind(now)
    .bind(id)
    .bind(DonationStatus::Pending)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Store a fresh OTP and move the donation to `to` in one write.
pub async fn store_otp(
    conn: &mut SqliteConnection,
    id: &str,
    from: DonationStatus,
    to: DonationStatus,
    otp: &str,
    expires_at: i64,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE food_donations
        SET    status = ?1, otp = ?2, otp_expiry = ?3, updated_at = ?4
        WHERE  id = ?5 AND status = ?6
        "#,
    )
    .bind(to)
    .bind(otp)
    .bind(expires_at)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Consume the OTP and move the donation to `to`, only if the code still matches
/// and has not expired.
pub async fn consume_otp(
    conn: &mut SqliteConnection,
    id: &str,
    from: DonationStatus,
    to: DonationStatus,
    otp: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE food_donations
        SET    status = ?1, otp = NULL, otp_expiry = NULL, updated_at = ?2
        WHERE  id = ?3 AND status = ?4 AND otp = ?5 AND otp_expiry >= ?2
        "#,
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .bind(otp)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn insert_review(
    conn: &mut SqliteConnection,
    donation_id: &str,
    ngo_id: &str,
    rating: i64,
    comment: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO donation_reviews (donation_id, ngo, rating, comment, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(donation_id)
    .bind(ngo_id)
    .bind(rating)
    .bind(comment)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Redistributions
// ─────────────────────────────────────────────────────────

pub async fn insert_redistribution(conn: &mut SqliteConnection, r: &Redistribution) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO redistributions
            (id, food_id, food_name, volunteer_name, volunteer_id, accepted_by_id,
             remaining_quantity, expiry_date, restaurant, latitude, longitude, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&r.id)
    .bind(&r.food_id)
    .bind(&r.food_name)
    .bind(&r.volunteer_name)
    .bind(&r.volunteer_id)
    .bind(&r.accepted_by_id)
    .bind(r.remaining_quantity)
    .bind(r.expiry_date.timestamp())
    .bind(&r.restaurant)
    .bind(r.current_location.latitude)
    .bind(r.current_location.longitude)
    .bind(r.status)
    .bind(r.created_at.timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append a redistribution id to the end of a donation's list.
pub async fn link_redistribution(
    conn: &mut SqliteConnection,
    donation_id: &str,
    redistribution_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO donation_redistributions (donation_id, position, redistribution_id)
        SELECT ?1, COALESCE(MAX(position) + 1, 0), ?2
        FROM   donation_redistributions
        WHERE  donation_id = ?1
        "#,
    )
    .bind(donation_id)
    .bind(redistribution_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_redistribution(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<RedistributionView>> {
    let sql = format!("{REDISTRIBUTION_SELECT} WHERE r.id = ?1");
    let row = sqlx::query_as::<_, RedistributionRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(RedistributionView::from))
}

pub async fn redistributions_with_status(
    conn: &mut SqliteConnection,
    status: RedistributionStatus,
) -> Result<Vec<RedistributionView>> {
    let sql = format!("{REDISTRIBUTION_SELECT} WHERE r.status = ?1 ORDER BY r.created_at DESC, r.rowid DESC");
    let rows = sqlx::query_as::<_, RedistributionRow>(&sql)
        .bind(status)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(RedistributionView::from).collect())
}

/// Redistributions a volunteer either spawned or picked up, newest first.
pub async fn redistributions_involving(
    conn: &mut SqliteConnection,
    volunteer_id: &str,
) -> Result<Vec<RedistributionView>> {
    let sql = format!(
        "{REDISTRIBUTION_SELECT} WHERE r.volunteer_id = ?1 OR r.accepted_by_id = ?1 \
         ORDER BY r.created_at DESC, r.rowid DESC"
    );
    let rows = sqlx::query_as::<_, RedistributionRow>(&sql)
        .bind(volunteer_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(RedistributionView::from).collect())
}

/// Claim an open redistribution. Returns `false` if it was no longer `from`.
pub async fn claim_redistribution(
    conn: &mut SqliteConnection,
    id: &str,
    from: RedistributionStatus,
    to: RedistributionStatus,
    accepted_by: &str,
    location: Location,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE redistributions
        SET    status = ?1, accepted_by_id = ?2, latitude = ?3, longitude = ?4
        WHERE  id = ?5 AND status = ?6
        "#,
    )
    .bind(to)
    .bind(accepted_by)
    .bind(location.latitude)
    .bind(location.longitude)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn set_redistribution_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: RedistributionStatus,
) -> Result<bool> {
    let rows = sqlx::query("UPDATE redistributions SET status = ?1 WHERE id = ?2")
        .bind(status)
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Test fixtures
// ─────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::models::Role;

    #[tokio::test]
    async fn pending_list_is_newest_first() {
        let pool = test_pool().await;
        insert_donation_row(&pool, "old", "5", DonationStatus::Pending, None, 100).await;
        insert_donation_row(&pool, "new", "5", DonationStatus::Pending, None, 200).await;
        insert_donation_row(&pool, "taken", "5", DonationStatus::Accepted, Some("v1"), 300).await;

        let mut conn = pool.acquire().await.unwrap();
        let pending = donations_with_status(&mut conn, DonationStatus::Pending)
            .await
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["new", "old"]);
    }

    #[tokio::test]
    async fn one_active_donation_per_volunteer_is_a_unique_index() {
        let pool = test_pool().await;
        insert_user(&pool, "v1", "Asha", Role::Volunteer, None).await;
        insert_donation_row(&pool, "a", "5", DonationStatus::Accepted, Some("v1"), 1).await;
        insert_donation_row(&pool, "b", "5", DonationStatus::Pending, None, 2).await;

        let mut conn = pool.acquire().await.unwrap();
        let volunteer = find_user(&mut conn, "v1").await.unwrap().unwrap();
        let err = claim_donation(&mut conn, "b", &volunteer, 3).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn transition_is_conditional_on_current_status() {
        let pool = test_pool().await;
        insert_donation_row(&pool, "d", "5", DonationStatus::Pending, None, 1).await;
        let mut conn = pool.acquire().await.unwrap();

        let moved = transition_donation(
            &mut conn,
            "d",
            DonationStatus::Accepted,
            DonationStatus::ArrivalForPickUp,
            2,
        )
        .await
        .unwrap();
        assert!(!moved);

        let moved = transition_donation(&mut conn, "d", DonationStatus::Pending, DonationStatus::Expired, 2)
            .await
            .unwrap();
        assert!(moved);
        let d = get_donation(&mut conn, "d").await.unwrap().unwrap();
        assert_eq!(d.status, DonationStatus::Expired);
    }

    #[tokio::test]
    async fn links_keep_append_order() {
        let pool = test_pool().await;
        insert_donation_row(&pool, "d", "5", DonationStatus::Redistributed, None, 1).await;
        let mut conn = pool.acquire().await.unwrap();
        for id in ["r-1", "r-2", "r-3"] {
            link_redistribution(&mut conn, "d", id).await.unwrap();
        }
        let d = get_donation(&mut conn, "d").await.unwrap().unwrap();
        assert_eq!(d.redistributions, ["r-1", "r-2", "r-3"]);
    }

    #[tokio::test]
    async fn expired_otp_is_not_consumed() {
        let pool = test_pool().await;
        insert_donation_row(&pool, "d", "5", DonationStatus::Accepted, Some("v1"), 1).await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(store_otp(
            &mut conn,
            "d",
            DonationStatus::Accepted,
            DonationStatus::ArrivalForPickUp,
            "123456",
            1_000,
            500,
        )
        .await
        .unwrap());

        let late = consume_otp(
            &mut conn,
            "d",
            DonationStatus::ArrivalForPickUp,
            DonationStatus::OutForDelivery,
            "123456",
            1_001,
        )
        .await
        .unwrap();
        assert!(!late);

        let on_time = consume_otp(
            &mut conn,
            "d",
            DonationStatus::ArrivalForPickUp,
            DonationStatus::OutForDelivery,
            "123456",
            1_000,
        )
        .await
        .unwrap();
        assert!(on_time);
        let d = get_donation(&mut conn, "d").await.unwrap().unwrap();
        assert_eq!(d.otp, None);
        assert_eq!(d.status, DonationStatus::OutForDelivery);
    }

    #[test]
    fn status_list_quotes_labels() {
        assert_eq!(
            status_list(&DonationStatus::ACTIVE),
            "('Accepted', 'Arrival for Pick Up', 'Out for Delivery')"
        );
    }
}
