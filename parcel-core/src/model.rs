//! Domain model for packages and users
//!
//! Records are serialized with camelCase field names. The same names are used
//! by query predicates, so they live in [`fields`] and are checked by tests
//! against the serialized form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Remote collection names
pub mod collections {
    pub const PACKAGES: &str = "packages";
    pub const USERS: &str = "users";
}

/// Document field names shared by writers and query predicates
pub mod fields {
    pub const TRACKING_NUMBER: &str = "trackingNumber";
    pub const USER_ID: &str = "userId";
    pub const STATUS: &str = "status";
    pub const DELIVERED_AT: &str = "deliveredAt";
    pub const CREATED_AT: &str = "createdAt";
    pub const EMAIL: &str = "email";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// Delivery status of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    #[default]
    Pending,
    InTransit,
    Delivered,
    Cancelled,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Pending => "pending",
            PackageStatus::InTransit => "in_transit",
            PackageStatus::Delivered => "delivered",
            PackageStatus::Cancelled => "cancelled",
        }
    }

    /// Delivered and cancelled packages never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PackageStatus::Delivered | PackageStatus::Cancelled)
    }

    /// Whether a package in this status may move to `next`.
    ///
    /// Status only moves forward along pending -> in_transit -> delivered,
    /// or to cancelled from a non-terminal status. Re-applying the current
    /// status is accepted for non-terminal states so retries stay harmless.
    pub fn can_transition_to(&self, next: PackageStatus) -> bool {
        use PackageStatus::*;
        match (self, next) {
            (Delivered | Cancelled, _) => false,
            (Pending, Pending | InTransit | Delivered | Cancelled) => true,
            (InTransit, InTransit | Delivered | Cancelled) => true,
            (InTransit, Pending) => false,
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(PackageStatus::Pending),
            "in_transit" => Ok(PackageStatus::InTransit),
            "delivered" => Ok(PackageStatus::Delivered),
            "cancelled" | "canceled" => Ok(PackageStatus::Cancelled),
            other => Err(format!("unknown package status: {}", other)),
        }
    }
}

/// Shipping priority, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Express,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Normal => "normal",
            Priority::Express => "express",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// Client-generated tracking number
pub struct TrackingNumber;

impl TrackingNumber {
    /// Generate a tracking number such as `PKG-1F3A9C0B7E21`.
    pub fn generate(prefix: &str) -> String {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", prefix.trim().to_ascii_uppercase(), raw[..12].to_ascii_uppercase())
    }
}

/// A shipment record
///
/// `id` stays empty until the remote store assigns one on create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    #[serde(default)]
    pub id: String,
    pub tracking_number: String,
    pub sender_name: String,
    pub recipient_name: String,
    pub recipient_address: String,
    pub recipient_phone: String,
    /// Weight in kilograms
    pub weight: f64,
    #[serde(default)]
    pub status: PackageStatus,
    #[serde(default)]
    pub priority: Priority,
    pub estimated_delivery_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub user_id: String,
}

impl Package {
    /// Create a pending package with a freshly generated tracking number.
    pub fn new(
        user_id: impl Into<String>,
        sender_name: impl Into<String>,
        recipient_name: impl Into<String>,
        recipient_address: impl Into<String>,
        recipient_phone: impl Into<String>,
        weight: f64,
        estimated_delivery_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            tracking_number: TrackingNumber::generate("PKG"),
            sender_name: sender_name.into(),
            recipient_name: recipient_name.into(),
            recipient_address: recipient_address.into(),
            recipient_phone: recipient_phone.into(),
            weight,
            status: PackageStatus::Pending,
            priority: Priority::Normal,
            estimated_delivery_at,
            created_at: Utc::now(),
            delivered_at: None,
            notes: None,
            user_id: user_id.into(),
        }
    }

    /// Check required fields and the delivered invariant.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("trackingNumber", &self.tracking_number),
            ("senderName", &self.sender_name),
            ("recipientName", &self.recipient_name),
            ("recipientAddress", &self.recipient_address),
            ("recipientPhone", &self.recipient_phone),
            ("userId", &self.user_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }

        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(format!("weight must be a positive number, got {}", self.weight));
        }

        match (self.status, self.delivered_at) {
            (PackageStatus::Delivered, None) => {
                Err("delivered package is missing deliveredAt".to_string())
            }
            (status, Some(_)) if status != PackageStatus::Delivered => Err(format!(
                "deliveredAt is only allowed on delivered packages (status is {})",
                status
            )),
            _ => Ok(()),
        }
    }
}

/// A user profile as stored remotely
///
/// Only the salted digest of the password is ever stored. It is written
/// under the `password` field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(rename = "password", default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Identity-only user rebuilt from an auth session when no profile is reachable.
    pub fn minimal(id: impl Into<String>, email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: email.into(),
            password_hash: String::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

/// Registration input
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl NewUser {
    pub fn new(username: impl Into<String>, email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Canonical form used for storing and matching email addresses.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
