use chrono::{DateTime, Utc};
use event_schema::events::OrderItem;
use serde::{Deserialize, Serialize};

/// One stock row.
#[derive(Debug, Clone)]
pub struct Product {
    pub product_id: String,
    pub available: i32,
    pub reserved: i32,
    pub version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Reserved,
    Released,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Released => "RELEASED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RESERVED" => Some(ReservationStatus::Reserved),
            "RELEASED" => Some(ReservationStatus::Released),
            _ => None,
        }
    }
}

/// A hold on stock for one order, keyed by order id.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub order_id: String,
    pub items: Vec<OrderItem>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [ReservationStatus::Reserved, ReservationStatus::Released] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("UNKNOWN"), None);
    }
}
