//! Read-side listings built on the same ledger sums as the calculator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Postgres, QueryBuilder};
use uuid::Uuid;

use super::calculator::{
    classify, push_ledger_sums, BandPolicy, BranchMatch, LedgerTotals, StockStatus, CRITICAL_BAND,
};
use crate::{
    database::Database,
    error::{StockError, StockResult},
    models::{Order, OrderType, RestockEntry},
};

const TOTAL_STOCK: &str = "(stock.restocked - stock.ordered - stock.sold)";

/// Status filter for staff stock screens. Mirrors [`classify`] with the
/// exact-band policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StockStatusFilter {
    Reorder,
    Critical,
    InStock,
}

impl StockStatusFilter {
    fn push_predicate(self, qb: &mut QueryBuilder<'_, Postgres>) {
        let band_distance = format!("ABS({} - stock.floor_level)", TOTAL_STOCK);
        match self {
            Self::Reorder => {
                qb.push(format!("({} <= 0 OR ({} <> ", TOTAL_STOCK, band_distance));
                qb.push_bind(CRITICAL_BAND);
                qb.push(format!(" AND {} < stock.floor_level))", TOTAL_STOCK));
            }
            Self::Critical => {
                qb.push(format!("({} > 0 AND {} = ", TOTAL_STOCK, band_distance));
                qb.push_bind(CRITICAL_BAND);
                qb.push(")");
            }
            Self::InStock => {
                qb.push(format!("({} > 0 AND {} <> ", TOTAL_STOCK, band_distance));
                qb.push_bind(CRITICAL_BAND);
                qb.push(format!(" AND {} >= stock.floor_level)", TOTAL_STOCK));
            }
        }
    }
}

impl From<StockStatusFilter> for StockStatus {
    fn from(filter: StockStatusFilter) -> Self {
        match filter {
            StockStatusFilter::Reorder => Self::Reorder,
            StockStatusFilter::Critical => Self::Critical,
            StockStatusFilter::InStock => Self::InStock,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StockFilter {
    /// Case-insensitive match on product name or SKU.
    pub search: Option<String>,
    pub category_ids: Vec<Uuid>,
    pub status: Option<StockStatusFilter>,
}

impl StockFilter {
    fn search_pattern(&self) -> Option<String> {
        let term = self.search.as_deref()?.trim();
        if term.is_empty() {
            return None;
        }
        let escaped = term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        Some(format!("%{}%", escaped))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, page_size: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.max(1),
        }
    }

    fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, request: PageRequest, total: i64) -> Self {
        let size = i64::from(request.page_size.max(1));
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total,
            total_pages: (total + size - 1) / size,
        }
    }
}

#[derive(Debug, FromRow)]
struct BranchStockRow {
    inventory_id: Uuid,
    product_id: Uuid,
    branch_id: Uuid,
    product_name: String,
    sku: String,
    unit_price: Decimal,
    cost_price: Decimal,
    floor_level: i32,
    requires_prescription: bool,
    category_name: Option<String>,
    #[sqlx(flatten)]
    totals: LedgerTotals,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchStockItem {
    pub inventory_id: Uuid,
    pub product_id: Uuid,
    pub branch_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub unit_price: Decimal,
    pub cost_price: Decimal,
    pub floor_level: i32,
    pub requires_prescription: bool,
    pub category_name: Option<String>,
    pub available: i64,
    pub status: StockStatus,
}

impl From<BranchStockRow> for BranchStockItem {
    fn from(row: BranchStockRow) -> Self {
        let available = row.totals.available();
        Self {
            inventory_id: row.inventory_id,
            product_id: row.product_id,
            branch_id: row.branch_id,
            product_name: row.product_name,
            sku: row.sku,
            unit_price: row.unit_price,
            cost_price: row.cost_price,
            floor_level: row.floor_level,
            requires_prescription: row.requires_prescription,
            category_name: row.category_name,
            available,
            status: classify(available, row.floor_level, BandPolicy::ExactBand),
        }
    }
}

/// Which extra predicate narrows the branch listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shelf {
    Everything,
    /// Active products with something on hand.
    Sellable,
}

/// Pushes `(<per-pair ledger sums>) stock [WHERE ...]` for one branch.
fn push_branch_stock(
    qb: &mut QueryBuilder<'_, Postgres>,
    branch_id: Uuid,
    filter: &StockFilter,
    shelf: Shelf,
) {
    qb.push(
        "(SELECT i.id AS inventory_id, p.id AS product_id, i.branch_id, p.name AS product_name, \
         p.sku, p.unit_price, p.cost_price, p.floor_level, p.requires_prescription, \
         c.name AS category_name, ",
    );
    push_ledger_sums(qb, "p.id", &BranchMatch::Column("i.branch_id"));
    qb.push(
        " FROM inventory i \
         JOIN products p ON p.id = i.product_id \
         LEFT JOIN categories c ON c.id = p.category_id \
         WHERE i.branch_id = ",
    );
    qb.push_bind(branch_id);

    if shelf == Shelf::Sellable {
        qb.push(" AND p.is_active = TRUE");
    }
    if let Some(pattern) = filter.search_pattern() {
        qb.push(" AND (p.name ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR p.sku ILIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
    if !filter.category_ids.is_empty() {
        qb.push(" AND p.category_id = ANY(");
        qb.push_bind(filter.category_ids.clone());
        qb.push(")");
    }
    qb.push(") stock");

    let mut clause = " WHERE ";
    if shelf == Shelf::Sellable {
        qb.push(clause);
        qb.push(format!("{} > 0", TOTAL_STOCK));
        clause = " AND ";
    }
    if let Some(status) = filter.status {
        qb.push(clause);
        status.push_predicate(qb);
    }
}

async fn ensure_branch(db: &Database, branch_id: Uuid) -> StockResult<()> {
    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM branches WHERE id = $1)")
        .bind(branch_id)
        .fetch_one(db)
        .await?;
    if !exists {
        return Err(StockError::NotFound("branch"));
    }
    Ok(())
}

/// Staff stock screen for one branch: every stocked pair with its derived
/// availability, filtered and paginated by product name.
pub async fn list_branch_stock(
    db: &Database,
    branch_id: Uuid,
    filter: &StockFilter,
    page: PageRequest,
) -> StockResult<Page<BranchStockItem>> {
    ensure_branch(db, branch_id).await?;

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM ");
    push_branch_stock(&mut count, branch_id, filter, Shelf::Everything);
    let total = count.build_query_scalar::<i64>().fetch_one(db).await?;

    let mut qb = QueryBuilder::new("SELECT * FROM ");
    push_branch_stock(&mut qb, branch_id, filter, Shelf::Everything);
    qb.push(" ORDER BY stock.product_name, stock.sku LIMIT ");
    qb.push_bind(i64::from(page.page_size));
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let items = qb
        .build_query_as::<BranchStockRow>()
        .fetch_all(db)
        .await?
        .into_iter()
        .map(BranchStockItem::from)
        .collect();

    Ok(Page::new(items, page, total))
}

/// Point-of-sale catalog: active products the branch can sell right now.
pub async fn list_sellable_products(
    db: &Database,
    branch_id: Uuid,
    filter: &StockFilter,
) -> StockResult<Vec<BranchStockItem>> {
    ensure_branch(db, branch_id).await?;

    let mut qb = QueryBuilder::new("SELECT * FROM ");
    push_branch_stock(&mut qb, branch_id, filter, Shelf::Sellable);
    qb.push(" ORDER BY stock.product_name");

    Ok(qb
        .build_query_as::<BranchStockRow>()
        .fetch_all(db)
        .await?
        .into_iter()
        .map(BranchStockItem::from)
        .collect())
}

/// Pairs that need attention, most depleted first.
pub async fn low_stock_alerts(db: &Database, branch_id: Uuid) -> StockResult<Vec<BranchStockItem>> {
    ensure_branch(db, branch_id).await?;

    let mut qb = QueryBuilder::new("SELECT * FROM ");
    push_branch_stock(&mut qb, branch_id, &StockFilter::default(), Shelf::Everything);

    let mut alerts: Vec<BranchStockItem> = qb
        .build_query_as::<BranchStockRow>()
        .fetch_all(db)
        .await?
        .into_iter()
        .map(BranchStockItem::from)
        .filter(|item| item.status != StockStatus::InStock)
        .collect();

    alerts.sort_by(|a, b| {
        (a.available - i64::from(a.floor_level))
            .cmp(&(b.available - i64::from(b.floor_level)))
            .then_with(|| a.product_name.cmp(&b.product_name))
    });
    Ok(alerts)
}

#[derive(Debug, Clone, Default)]
pub struct IncomingFilter {
    pub order_type: Option<OrderType>,
    /// Matches the customer's name or email.
    pub search: Option<String>,
}

/// Orders waiting for branch assignment, newest first.
pub async fn list_incoming_orders(
    db: &Database,
    filter: &IncomingFilter,
    page: PageRequest,
) -> StockResult<Page<Order>> {
    fn push_conditions(qb: &mut QueryBuilder<'_, Postgres>, filter: &IncomingFilter) {
        qb.push(" FROM orders o JOIN users u ON u.id = o.customer_id WHERE o.branch_id IS NULL");
        if let Some(order_type) = filter.order_type {
            qb.push(" AND o.order_type = ");
            qb.push_bind(order_type.as_str());
        }
        let search = StockFilter { search: filter.search.clone(), ..Default::default() };
        if let Some(pattern) = search.search_pattern() {
            qb.push(" AND (CONCAT(u.first_name, ' ', u.last_name) ILIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR u.email ILIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }
    }

    let mut count = QueryBuilder::new("SELECT COUNT(*)");
    push_conditions(&mut count, filter);
    let total = count.build_query_scalar::<i64>().fetch_one(db).await?;

    let mut qb = QueryBuilder::new("SELECT o.*");
    push_conditions(&mut qb, filter);
    qb.push(" ORDER BY o.created_at DESC LIMIT ");
    qb.push_bind(i64::from(page.page_size));
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let orders = qb.build_query_as::<Order>().fetch_all(db).await?;
    Ok(Page::new(orders, page, total))
}

#[derive(Debug, Clone, Default)]
pub struct RestockFilter {
    /// Case-insensitive match on product name or SKU.
    pub search: Option<String>,
    pub category_ids: Vec<Uuid>,
    pub batch_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RestockListItem {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub entry: RestockEntry,
    pub product_name: String,
    pub sku: String,
    pub category_name: Option<String>,
}

fn push_restock_conditions(qb: &mut QueryBuilder<'_, Postgres>, branch_id: Uuid, filter: &RestockFilter) {
    qb.push(
        " FROM restock r \
         JOIN products p ON p.id = r.product_id \
         LEFT JOIN categories c ON c.id = p.category_id \
         WHERE r.branch_id = ",
    );
    qb.push_bind(branch_id);

    let search = StockFilter { search: filter.search.clone(), ..Default::default() };
    if let Some(pattern) = search.search_pattern() {
        qb.push(" AND (p.name ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR p.sku ILIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
    if !filter.category_ids.is_empty() {
        qb.push(" AND p.category_id = ANY(");
        qb.push_bind(filter.category_ids.clone());
        qb.push(")");
    }
    if let Some(batch) = filter.batch_number.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        qb.push(" AND r.batch_number = ");
        qb.push_bind(batch.to_string());
    }
}

/// Restock history of one branch, newest first.
pub async fn list_restocks(
    db: &Database,
    branch_id: Uuid,
    filter: &RestockFilter,
    page: PageRequest,
) -> StockResult<Page<RestockListItem>> {
    ensure_branch(db, branch_id).await?;

    let mut count = QueryBuilder::new("SELECT COUNT(*)");
    push_restock_conditions(&mut count, branch_id, filter);
    let total = count.build_query_scalar::<i64>().fetch_one(db).await?;

    let mut qb = QueryBuilder::new("SELECT r.*, p.name AS product_name, p.sku, c.name AS category_name");
    push_restock_conditions(&mut qb, branch_id, filter);
    qb.push(" ORDER BY r.created_at DESC LIMIT ");
    qb.push_bind(i64::from(page.page_size));
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let items = qb.build_query_as::<RestockListItem>().fetch_all(db).await?;
    Ok(Page::new(items, page, total))
}

/// Batch numbers ever delivered to the branch, latest label first.
pub async fn list_batch_numbers(db: &Database, branch_id: Uuid) -> StockResult<Vec<String>> {
    Ok(sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT batch_number FROM restock WHERE branch_id = $1 ORDER BY batch_number DESC",
    )
    .bind(branch_id)
    .fetch_all(db)
    .await?)
}
