use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Branch {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub sku: String,
    pub category_id: Option<Uuid>,
    pub unit_price: Decimal,
    pub cost_price: Decimal,
    /// Reorder threshold.
    pub floor_level: i32,
    pub requires_prescription: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Marks a product as stocked at a branch. Holds no quantity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryPairing {
    pub id: Uuid,
    pub product_id: Uuid,
    pub branch_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RestockEntry {
    pub id: Uuid,
    pub product_id: Uuid,
    pub branch_id: Uuid,
    pub quantity: i32,
    pub expiry_date: NaiveDate,
    pub batch_number: String,
    pub created_at: DateTime<Utc>,
}

impl RestockEntry {
    /// Batch numbers default to the day of entry, `DDMMYY`.
    pub fn default_batch_number(at: DateTime<Utc>) -> String {
        at.format("%d%m%y").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn batch_number_is_day_month_short_year() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 15, 30, 0).unwrap();
        assert_eq!(RestockEntry::default_batch_number(at), "070324");
    }
}
