//! Derived stock availability.
//!
//! Available quantity is never stored. It is recomputed from the restock,
//! order_items and sale_items ledgers on every read, and the only writers of
//! those ledgers are the functions in [`commit`].

pub mod calculator;
pub mod commit;
pub mod gate;
pub mod listing;

pub use calculator::{
    classify, compute_available, get_stock_status, BandPolicy, CustomerAvailability,
    LedgerTotals, StockReport, StockScope, StockStatus, CRITICAL_BAND,
};
pub use commit::{
    assign_orders, commit_order, commit_sale, delete_order, delete_restock, delete_sale,
    edit_order_lines, edit_sale, record_restock, record_restocks, update_order_status,
    update_payment_status, update_restock, Assignment, DeliveryDetails, OrderDraft, OrderEdit,
    RestockBatch, RestockDraft, RestockLine, RestockUpdate, SaleDraft, SaleEdit, TaxPolicy,
};
pub use gate::{
    aggregate, check_availability, find_violations, AvailabilityReport, LineItem, RawLineItem,
    RawLines, StockRequest, Violation,
};
pub use listing::{
    list_batch_numbers, list_branch_stock, list_incoming_orders, list_restocks,
    list_sellable_products, low_stock_alerts, BranchStockItem, IncomingFilter, Page, PageRequest,
    RestockFilter, RestockListItem, StockFilter, StockStatusFilter,
};
