//! One-time codes for the pick-up handoff.
//!
//! A code is six decimal digits, lives on the donation row with an expiry,
//! and is consumed by the pick-up confirmation. Sending the code out is
//! best-effort: the code is already committed by the time [`dispatch`] runs,
//! and a failure for one recipient never stops the others.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use crate::errors::{AppError, Result};
use crate::models::{FoodDonation, User};
use crate::sms::SmsSender;

pub const OTP_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Draw a fresh code valid for `ttl` from `now`.
pub fn issue(now: DateTime<Utc>, ttl: Duration) -> IssuedOtp {
    let upper = 10u32.pow(OTP_LEN as u32);
    let code = rand::thread_rng().gen_range(upper / 10..upper).to_string();
    IssuedOtp {
        code,
        expires_at: now + ttl,
    }
}

/// Check a submitted code against what is stored on the donation.
/// Missing, wrong and expired codes all fail with [`AppError::InvalidOtp`].
pub fn verify(
    stored: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    submitted: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    match (stored, expires_at) {
        (Some(code), Some(expiry)) if code == submitted.trim() && now <= expiry => Ok(()),
        _ => Err(AppError::InvalidOtp),
    }
}

/// Normalise a stored phone number to E.164 by prefixing the default country code.
pub fn format_phone(raw: &str, default_country_code: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('+') {
        raw.to_string()
    } else {
        format!("{default_country_code}{raw}")
    }
}

pub fn render_message(code: &str, donation: &FoodDonation) -> String {
    format!(
        "Your OTP for food donation pick up is {code}. Food Item: {}, Quantity: {}, Expiry Date: {}",
        donation.food_name,
        donation.quantity,
        donation.expiry_date.format("%d/%m/%Y"),
    )
}

/// Send `body` to every recipient with a phone number. Returns how many sends succeeded.
pub async fn dispatch(
    sender: Arc<dyn SmsSender>,
    recipients: Vec<User>,
    body: String,
    default_country_code: String,
) -> usize {
    let mut sent = 0;
    for recipient in recipients {
        let Some(phone) = recipient.phone_number.as_deref() else {
            warn!("Recipient {} does not have a phone number", recipient.id);
            continue;
        };
        let to = format_phone(phone, &default_country_code);
        match sender.send(&to, &body).await {
            Ok(sid) => {
                info!("OTP sent to {to}: {sid}");
                sent += 1;
            }
            Err(e) => error!("Error sending OTP to {to}: {e}"),
        }
    }
    sent
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::testing::RecordingSms;
    use super::*;
    use crate::lifecycle::DonationStatus;
    use crate::models::Role;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap()
    }

    fn user(id: &str, phone: Option<&str>) -> User {
        User {
            id: id.into(),
            name: id.into(),
            role: Role::Volunteer,
            phone_number: phone.map(String::from),
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn issued_code_is_six_digits_ten_minutes_out() {
        for _ in 0..100 {
            let otp = issue(at(0), Duration::minutes(10));
            assert_eq!(otp.code.len(), OTP_LEN);
            assert!(otp.code.chars().all(|c| c.is_ascii_digit()));
            assert_eq!(otp.expires_at, at(10));
        }
    }

    #[test]
    fn verify_round_trip() {
        let otp = issue(at(0), Duration::minutes(10));
        let stored = Some(otp.code.as_str());
        let expiry = Some(otp.expires_at);

        assert!(verify(stored, expiry, &otp.code, at(1)).is_ok());
        assert!(verify(stored, expiry, &otp.code, at(10)).is_ok());
        assert!(matches!(
            verify(stored, expiry, &otp.code, at(11)),
            Err(AppError::InvalidOtp)
        ));
        assert!(matches!(
            verify(stored, expiry, "000000", at(1)),
            Err(AppError::InvalidOtp)
        ));
        assert!(matches!(
            verify(None, None, &otp.code, at(1)),
            Err(AppError::InvalidOtp)
        ));
    }

    #[test]
    fn wrong_and_expired_look_the_same() {
        let wrong = verify(Some("111111"), Some(at(10)), "222222", at(1)).unwrap_err();
        let expired = verify(Some("111111"), Some(at(10)), "111111", at(20)).unwrap_err();
        assert_eq!(wrong.to_string(), expired.to_string());
        assert_eq!(wrong.status_code(), expired.status_code());
    }

    #[test]
    fn phone_numbers_get_country_code() {
        assert_eq!(format_phone("9876543210", "+91"), "+919876543210");
        assert_eq!(format_phone(" +447700900123 ", "+91"), "+447700900123");
    }

    #[test]
    fn message_mentions_food() {
        let donation = FoodDonation {
            id: "d".into(),
            food_name: "Rice".into(),
            quantity: "20".into(),
            food_type: "veg".into(),
            expiry_date: at(0),
            schedule_pick_up: at(0),
            restaurant_pincode: None,
            restaurant_name: None,
            restaurant_user: "r".into(),
            accepted_by_id: None,
            accepted_by: None,
            status: DonationStatus::Accepted,
            otp: None,
            otp_expiry: None,
            redistributions: vec![],
            review: None,
            reviews: vec![],
            created_at: at(0),
            updated_at: at(0),
        };
        let msg = render_message("123456", &donation);
        assert!(msg.contains("123456"));
        assert!(msg.contains("Food Item: Rice, Quantity: 20"));
        assert!(msg.ends_with("01/03/2025"));
    }

    #[tokio::test]
    async fn dispatch_skips_missing_phones_and_failures() {
        let sms = Arc::new(RecordingSms {
            failing: vec!["+910000000000".into()],
            ..Default::default()
        });
        let recipients = vec![
            user("no-phone", None),
            user("broken", Some("0000000000")),
            user("ok", Some("9876543210")),
        ];

        let sent = dispatch(sms.clone(), recipients, "code".into(), "+91".into()).await;

        assert_eq!(sent, 1);
        let log = sms.sent.lock().unwrap();
        assert_eq!(log.as_slice(), [("+919876543210".to_string(), "code".to_string())]);
    }
}
