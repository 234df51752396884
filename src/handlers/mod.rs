pub mod api;
pub mod extract;
pub mod inventory;
pub mod orders;
pub mod pos;
pub mod sales;
