use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    /// Customer self-service entry state; the order has no branch yet.
    Requested,
    Pending,
    Processing,
    Ready,
    Shipped,
    Completed,
    Cancelled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderType {
    Pickup,
    Delivery,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
    Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiscountType {
    Percentage,
    #[default]
    Fixed,
}

text_column!(OrderStatus, OrderType, DiscountType);

impl OrderStatus {
    /// Only these statuses count against a branch's stock.
    pub fn consumes_stock(self) -> bool {
        matches!(self, Self::Ready | Self::Shipped | Self::Completed)
    }

    pub fn consuming() -> Vec<String> {
        Self::iter()
            .filter(|s| s.consumes_stock())
            .map(|s| s.as_str().to_string())
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Single forward steps of the order lifecycle.
    pub fn next_states(self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Requested => &[Pending, Cancelled],
            Pending => &[Processing, Cancelled],
            Processing => &[Ready, Shipped, Cancelled],
            Ready | Shipped => &[Completed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    /// True when `target` is this status or reachable by forward steps.
    /// Staff may skip intermediate steps but never move backwards.
    pub fn can_reach(self, target: OrderStatus) -> bool {
        if self == target {
            return true;
        }
        let mut frontier = vec![self];
        let mut seen = Vec::new();
        while let Some(status) = frontier.pop() {
            for &next in status.next_states() {
                if next == target {
                    return true;
                }
                if !seen.contains(&next) {
                    seen.push(next);
                    frontier.push(next);
                }
            }
        }
        false
    }
}

impl DiscountType {
    /// Money taken off `subtotal` for an entered discount value.
    pub fn amount(self, subtotal: Decimal, discount: Decimal) -> Decimal {
        match self {
            Self::Percentage => (subtotal * discount / Decimal::ONE_HUNDRED).round_dp(2),
            Self::Fixed => discount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    /// `None` while the order sits in the incoming queue.
    pub branch_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub order_type: OrderType,
    #[sqlx(try_from = "String")]
    pub status: OrderStatus,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    #[sqlx(try_from = "String")]
    pub discount_type: DiscountType,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    pub delivery_address: Option<String>,
    pub delivery_city: Option<String>,
    pub delivery_state: Option<String>,
    pub delivery_zip: Option<String>,
    pub notes: Option<String>,
    pub created_by: Uuid,
    pub updated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}
