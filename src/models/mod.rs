// Enumerations persisted as CHECK-constrained TEXT columns decode through
// `#[sqlx(try_from = "String")]`.
macro_rules! text_column {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = strum::ParseError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }

            impl $ty {
                pub fn as_str(&self) -> &'static str {
                    self.into()
                }
            }
        )+
    };
}

pub mod inventory;
pub mod order;
pub mod sale;
pub mod user;

pub use inventory::{Branch, InventoryPairing, Product, RestockEntry};
pub use order::{DiscountType, Order, OrderItem, OrderStatus, OrderType};
pub use sale::{PaymentMethod, PaymentStatus, Sale, SaleItem};
pub use user::{BranchAccess, Role, User};
