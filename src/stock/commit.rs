//! The only writers of the restock, order and sale ledgers.
//!
//! Each operation runs in one transaction: the availability gate takes its
//! row locks and reads the ledgers on the same connection that then writes
//! the new rows, and any failure rolls the whole transaction back.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    calculator::StockScope,
    gate::{self, LineItem, StockRequest},
};
use crate::{
    database::Database,
    error::{StockError, StockResult},
    models::{
        Branch, BranchAccess, DiscountType, InventoryPairing, Order, OrderItem, OrderStatus,
        OrderType, PaymentMethod, PaymentStatus, Product, RestockEntry, Sale, SaleItem,
    },
};

#[derive(Debug, Clone)]
pub struct SaleDraft {
    pub branch_id: Uuid,
    pub employee_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub lines: Vec<LineItem>,
    pub tax: Decimal,
    pub discount: Decimal,
    pub discount_type: DiscountType,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxPolicy {
    Amount(Decimal),
    /// Fraction of the subtotal, e.g. `0.08`.
    Rate(Decimal),
}

impl TaxPolicy {
    pub fn tax_on(self, subtotal: Decimal) -> Decimal {
        match self {
            Self::Amount(amount) => amount,
            Self::Rate(rate) => (subtotal * rate).round_dp(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryDetails {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub customer_id: Uuid,
    /// `None` places the order in the incoming queue.
    pub branch_id: Option<Uuid>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub lines: Vec<LineItem>,
    pub tax: TaxPolicy,
    pub discount: Decimal,
    pub discount_type: DiscountType,
    pub delivery_fee: Decimal,
    pub delivery: DeliveryDetails,
    pub notes: Option<String>,
    pub created_by: Uuid,
}

/// Routes incoming orders to a branch and reprices them.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub order_ids: Vec<Uuid>,
    pub branch_id: Uuid,
    pub discount: Decimal,
    pub discount_type: DiscountType,
    pub delivery_fee: Decimal,
    /// Defaults to `pending`.
    pub status: Option<OrderStatus>,
    pub assigned_by: Uuid,
}

#[derive(Debug, Clone)]
pub struct RestockDraft {
    pub product_id: Uuid,
    pub branch_id: Uuid,
    pub quantity: i32,
    pub expiry_date: NaiveDate,
    pub batch_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestockLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub expiry_date: NaiveDate,
}

/// One delivery of several products to a branch under a shared batch number.
#[derive(Debug, Clone)]
pub struct RestockBatch {
    pub branch_id: Uuid,
    pub lines: Vec<RestockLine>,
    pub batch_number: Option<String>,
}

/// Corrected values for an existing restock entry. The product is fixed.
#[derive(Debug, Clone, Copy)]
pub struct RestockUpdate {
    pub branch_id: Uuid,
    pub quantity: i32,
    pub expiry_date: NaiveDate,
}

/// Replacement lines and money fields for an order. Status moves through
/// [`update_order_status`].
#[derive(Debug, Clone)]
pub struct OrderEdit {
    pub lines: Vec<LineItem>,
    pub tax: Decimal,
    pub discount: Decimal,
    pub discount_type: DiscountType,
    pub delivery_fee: Decimal,
    pub notes: Option<String>,
    pub edited_by: Uuid,
}

/// Replacement lines and money fields for a sale. Payment status moves
/// through [`update_payment_status`].
#[derive(Debug, Clone)]
pub struct SaleEdit {
    pub lines: Vec<LineItem>,
    pub tax: Decimal,
    pub discount: Decimal,
    pub discount_type: DiscountType,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct PricedLine {
    product_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
    subtotal: Decimal,
}

fn ensure_non_negative(amount: Decimal, field: &str) -> StockResult<()> {
    if amount < Decimal::ZERO {
        return Err(StockError::invalid(format!("{} cannot be negative", field)));
    }
    Ok(())
}

fn validate_lines(lines: &[LineItem]) -> StockResult<()> {
    if lines.is_empty() {
        return Err(StockError::invalid("no line items provided"));
    }
    for line in lines {
        if line.quantity <= 0 {
            return Err(StockError::invalid("quantities must be positive"));
        }
        if let Some(price) = line.unit_price {
            ensure_non_negative(price, "unit price")?;
        }
        if let Some(subtotal) = line.subtotal {
            ensure_non_negative(subtotal, "line subtotal")?;
        }
    }
    Ok(())
}

fn sorted_unique(ids: &[Uuid]) -> Vec<Uuid> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

fn total_of(lines: &[PricedLine]) -> Decimal {
    lines.iter().map(|line| line.subtotal).sum()
}

/// Commits on success, rolls back otherwise.
async fn finish<T>(tx: Transaction<'_, Postgres>, result: StockResult<T>) -> StockResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                log::warn!("Rollback failed: {}", rollback);
            }
            Err(err)
        }
    }
}

async fn ensure_active_branch(conn: &mut PgConnection, branch_id: Uuid) -> StockResult<()> {
    let branch = sqlx::query_as::<_, Branch>("SELECT * FROM branches WHERE id = $1")
        .bind(branch_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StockError::NotFound("branch"))?;

    if !branch.is_active {
        return Err(StockError::invalid(format!("branch {} is inactive", branch.name)));
    }
    Ok(())
}

async fn ensure_active_products(conn: &mut PgConnection, lines: &[LineItem]) -> StockResult<()> {
    let ids = sorted_unique(&lines.iter().map(|l| l.product_id).collect::<Vec<_>>());
    let active = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM products WHERE id = ANY($1) AND is_active = TRUE",
    )
    .bind(&ids)
    .fetch_one(&mut *conn)
    .await?;

    if active != ids.len() as i64 {
        return Err(StockError::NotFound("product"));
    }
    Ok(())
}

/// Freezes line prices: explicit prices are kept as submitted, missing
/// ones come from the product's current price.
async fn price_lines(conn: &mut PgConnection, lines: &[LineItem]) -> StockResult<Vec<PricedLine>> {
    let ids = sorted_unique(&lines.iter().map(|l| l.product_id).collect::<Vec<_>>());
    let current: HashMap<Uuid, Decimal> =
        sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|product| (product.id, product.unit_price))
            .collect();

    lines
        .iter()
        .map(|line| -> StockResult<PricedLine> {
            let current_price = current
                .get(&line.product_id)
                .copied()
                .ok_or(StockError::NotFound("product"))?;
            let unit_price = line.unit_price.unwrap_or(current_price);
            let subtotal = line
                .subtotal
                .unwrap_or_else(|| unit_price * Decimal::from(line.quantity));
            Ok(PricedLine {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price,
                subtotal,
            })
        })
        .collect()
}

async fn insert_items(
    conn: &mut PgConnection,
    items_table: &str,
    parent_column: &str,
    parent_id: Uuid,
    lines: &[PricedLine],
) -> StockResult<()> {
    let sql = format!(
        "INSERT INTO {} ({}, product_id, quantity, unit_price, subtotal) VALUES ($1, $2, $3, $4, $5)",
        items_table, parent_column
    );
    for line in lines {
        sqlx::query(&sql)
            .bind(parent_id)
            .bind(line.product_id)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.subtotal)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn order_requests(conn: &mut PgConnection, order_id: Uuid) -> StockResult<Vec<StockRequest>> {
    let items = sqlx::query_as::<_, OrderItem>("SELECT * FROM order_items WHERE order_id = $1")
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(items
        .iter()
        .map(|item| StockRequest { product_id: item.product_id, quantity: i64::from(item.quantity) })
        .collect())
}

async fn sale_requests(conn: &mut PgConnection, sale_id: Uuid) -> StockResult<Vec<StockRequest>> {
    let items = sqlx::query_as::<_, SaleItem>("SELECT * FROM sale_items WHERE sale_id = $1")
        .bind(sale_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(items
        .iter()
        .map(|item| StockRequest { product_id: item.product_id, quantity: i64::from(item.quantity) })
        .collect())
}

/// Orders still in the incoming queue belong to no branch, so only users
/// reaching every branch may touch them.
fn ensure_order_access(order: &Order, access: &BranchAccess) -> StockResult<()> {
    let permitted = match order.branch_id {
        Some(branch_id) => access.allows(branch_id),
        None => matches!(access, BranchAccess::All),
    };
    if permitted {
        Ok(())
    } else {
        Err(StockError::Forbidden)
    }
}

async fn lock_order(conn: &mut PgConnection, order_id: Uuid) -> StockResult<Option<Order>> {
    Ok(sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn commit_sale(db: &Database, draft: SaleDraft) -> StockResult<Uuid> {
    validate_lines(&draft.lines)?;
    ensure_non_negative(draft.tax, "tax")?;
    ensure_non_negative(draft.discount, "discount")?;

    let mut tx = db.begin().await?;
    let result = insert_sale(&mut tx, &draft).await;
    let sale_id = finish(tx, result).await.map_err(|err| {
        if let StockError::InsufficientStock(v) = &err {
            log::warn!("Sale at branch {} rejected: {} item(s) short", draft.branch_id, v.len());
        }
        err
    })?;

    log::info!(
        "Sale {} committed at branch {} ({} line(s))",
        sale_id,
        draft.branch_id,
        draft.lines.len()
    );
    Ok(sale_id)
}

async fn insert_sale(conn: &mut PgConnection, draft: &SaleDraft) -> StockResult<Uuid> {
    ensure_active_branch(conn, draft.branch_id).await?;
    gate::enforce(
        conn,
        StockScope::Branch(draft.branch_id),
        draft.lines.iter().map(LineItem::request),
    )
    .await?;

    let lines = price_lines(conn, &draft.lines).await?;
    let subtotal = total_of(&lines);
    let total = subtotal + draft.tax - draft.discount_type.amount(subtotal, draft.discount);
    if total < Decimal::ZERO {
        return Err(StockError::invalid("discount exceeds the sale total"));
    }

    let sale_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO sales (
            branch_id, employee_id, customer_id, subtotal, tax, discount, discount_type,
            total, payment_method, payment_status, notes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(draft.branch_id)
    .bind(draft.employee_id)
    .bind(draft.customer_id)
    .bind(subtotal)
    .bind(draft.tax)
    .bind(draft.discount)
    .bind(draft.discount_type.as_str())
    .bind(total)
    .bind(draft.payment_method.as_str())
    .bind(draft.payment_status.as_str())
    .bind(&draft.notes)
    .fetch_one(&mut *conn)
    .await?;

    insert_items(conn, "sale_items", "sale_id", sale_id, &lines).await?;

    Ok(sale_id)
}

/// Moving a sale into `paid` starts consuming stock, so that transition is gated.
pub async fn update_payment_status(db: &Database, sale_id: Uuid, status: PaymentStatus) -> StockResult<Sale> {
    let mut tx = db.begin().await?;
    let result = set_payment_status(&mut tx, sale_id, status).await;
    let sale = finish(tx, result).await?;
    log::info!("Sale {} payment status set to {}", sale_id, status);
    Ok(sale)
}

async fn lock_sale(conn: &mut PgConnection, sale_id: Uuid) -> StockResult<Sale> {
    sqlx::query_as::<_, Sale>("SELECT * FROM sales WHERE id = $1 FOR UPDATE")
        .bind(sale_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StockError::NotFound("sale"))
}

async fn set_payment_status(conn: &mut PgConnection, sale_id: Uuid, status: PaymentStatus) -> StockResult<Sale> {
    let sale = lock_sale(conn, sale_id).await?;

    if status.consumes_stock() && !sale.payment_status.consumes_stock() {
        let requests = sale_requests(conn, sale_id).await?;
        gate::enforce(conn, StockScope::Branch(sale.branch_id), requests).await?;
    }

    Ok(
        sqlx::query_as::<_, Sale>("UPDATE sales SET payment_status = $1 WHERE id = $2 RETURNING *")
            .bind(status.as_str())
            .bind(sale_id)
            .fetch_one(&mut *conn)
            .await?,
    )
}

/// Replaces a sale's lines and money fields. A paid sale is gated again
/// with its old lines already out of the ledger.
pub async fn edit_sale(db: &Database, sale_id: Uuid, edit: SaleEdit) -> StockResult<Sale> {
    validate_lines(&edit.lines)?;
    ensure_non_negative(edit.tax, "tax")?;
    ensure_non_negative(edit.discount, "discount")?;

    let mut tx = db.begin().await?;
    let result = rewrite_sale(&mut tx, sale_id, &edit).await;
    let sale = finish(tx, result).await.map_err(|err| {
        if let StockError::InsufficientStock(v) = &err {
            log::warn!("Edit of sale {} rejected: {} item(s) short", sale_id, v.len());
        }
        err
    })?;

    log::info!("Sale {} edited ({} line(s))", sale_id, edit.lines.len());
    Ok(sale)
}

async fn rewrite_sale(conn: &mut PgConnection, sale_id: Uuid, edit: &SaleEdit) -> StockResult<Sale> {
    let sale = lock_sale(conn, sale_id).await?;

    sqlx::query("DELETE FROM sale_items WHERE sale_id = $1")
        .bind(sale_id)
        .execute(&mut *conn)
        .await?;
    if sale.payment_status.consumes_stock() {
        gate::enforce(
            conn,
            StockScope::Branch(sale.branch_id),
            edit.lines.iter().map(LineItem::request),
        )
        .await?;
    }

    let lines = price_lines(conn, &edit.lines).await?;
    let subtotal = total_of(&lines);
    let total = subtotal + edit.tax - edit.discount_type.amount(subtotal, edit.discount);
    if total < Decimal::ZERO {
        return Err(StockError::invalid("discount exceeds the sale total"));
    }
    insert_items(conn, "sale_items", "sale_id", sale_id, &lines).await?;

    Ok(sqlx::query_as::<_, Sale>(
        r#"
        UPDATE sales
        SET subtotal = $1, tax = $2, discount = $3, discount_type = $4, total = $5,
            payment_method = $6, notes = $7
        WHERE id = $8
        RETURNING *
        "#,
    )
    .bind(subtotal)
    .bind(edit.tax)
    .bind(edit.discount)
    .bind(edit.discount_type.as_str())
    .bind(total)
    .bind(edit.payment_method.as_str())
    .bind(&edit.notes)
    .bind(sale_id)
    .fetch_one(&mut *conn)
    .await?)
}

pub async fn delete_sale(db: &Database, sale_id: Uuid) -> StockResult<()> {
    let mut tx = db.begin().await?;
    let result = delete_with_items(&mut tx, "sale_items", "sale_id", "sales", sale_id, "sale").await;
    finish(tx, result).await?;
    log::info!("Sale {} deleted", sale_id);
    Ok(())
}

async fn delete_with_items(
    conn: &mut PgConnection,
    items_table: &str,
    parent_column: &str,
    parent_table: &str,
    id: Uuid,
    entity: &'static str,
) -> StockResult<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE {} = $1", items_table, parent_column))
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let deleted = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", parent_table))
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if deleted == 0 {
        return Err(StockError::NotFound(entity));
    }
    Ok(())
}

fn validate_order(draft: &OrderDraft) -> StockResult<()> {
    validate_lines(&draft.lines)?;
    ensure_non_negative(draft.discount, "discount")?;
    ensure_non_negative(draft.delivery_fee, "delivery fee")?;
    let (TaxPolicy::Amount(tax) | TaxPolicy::Rate(tax)) = draft.tax;
    ensure_non_negative(tax, "tax")?;

    match (draft.branch_id, draft.status) {
        (None, OrderStatus::Requested) => Ok(()),
        (None, _) => Err(StockError::invalid("orders without a branch must be in the requested state")),
        (Some(_), OrderStatus::Requested) => Err(StockError::invalid("requested orders cannot be assigned to a branch yet")),
        (Some(_), _) => Ok(()),
    }
}

pub async fn commit_order(db: &Database, draft: OrderDraft) -> StockResult<Uuid> {
    validate_order(&draft)?;

    let mut tx = db.begin().await?;
    let result = insert_order(&mut tx, &draft).await;
    let order_id = finish(tx, result).await.map_err(|err| {
        if let StockError::InsufficientStock(v) = &err {
            log::warn!("Order for customer {} rejected: {} item(s) short", draft.customer_id, v.len());
        }
        err
    })?;

    match draft.branch_id {
        Some(branch_id) => log::info!("Order {} committed at branch {} as {}", order_id, branch_id, draft.status),
        None => log::info!("Order {} queued for branch assignment", order_id),
    }
    Ok(order_id)
}

async fn insert_order(conn: &mut PgConnection, draft: &OrderDraft) -> StockResult<Uuid> {
    let customer_exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_active = TRUE)",
    )
    .bind(draft.customer_id)
    .fetch_one(&mut *conn)
    .await?;
    if !customer_exists {
        return Err(StockError::NotFound("customer"));
    }
    match draft.branch_id {
        Some(branch_id) => ensure_active_branch(conn, branch_id).await?,
        // Customer checkout only sells what the catalog still offers.
        None => ensure_active_products(conn, &draft.lines).await?,
    }

    gate::enforce(
        conn,
        StockScope::from(draft.branch_id),
        draft.lines.iter().map(LineItem::request),
    )
    .await?;

    let lines = price_lines(conn, &draft.lines).await?;
    let subtotal = total_of(&lines);
    let tax = draft.tax.tax_on(subtotal);
    let total = subtotal + tax - draft.discount_type.amount(subtotal, draft.discount) + draft.delivery_fee;
    if total < Decimal::ZERO {
        return Err(StockError::invalid("discount exceeds the order total"));
    }

    let delivery = match draft.order_type {
        OrderType::Delivery => draft.delivery.clone(),
        OrderType::Pickup => DeliveryDetails::default(),
    };

    let order_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO orders (
            customer_id, branch_id, order_type, status, subtotal, tax, discount, discount_type,
            delivery_fee, total, delivery_address, delivery_city, delivery_state, delivery_zip,
            notes, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        RETURNING id
        "#,
    )
    .bind(draft.customer_id)
    .bind(draft.branch_id)
    .bind(draft.order_type.as_str())
    .bind(draft.status.as_str())
    .bind(subtotal)
    .bind(tax)
    .bind(draft.discount)
    .bind(draft.discount_type.as_str())
    .bind(draft.delivery_fee)
    .bind(total)
    .bind(delivery.address)
    .bind(delivery.city)
    .bind(delivery.state)
    .bind(delivery.zip)
    .bind(&draft.notes)
    .bind(draft.created_by)
    .fetch_one(&mut *conn)
    .await?;

    insert_items(conn, "order_items", "order_id", order_id, &lines).await?;

    Ok(order_id)
}

/// Assigns unassigned orders to a branch. Orders that no longer exist or
/// were already routed are skipped; returns how many were assigned.
pub async fn assign_orders(db: &Database, assignment: Assignment) -> StockResult<usize> {
    if assignment.order_ids.is_empty() {
        return Err(StockError::invalid("no orders selected"));
    }
    ensure_non_negative(assignment.discount, "discount")?;
    ensure_non_negative(assignment.delivery_fee, "delivery fee")?;

    let target = assignment.status.unwrap_or(OrderStatus::Pending);
    if target == OrderStatus::Requested {
        return Err(StockError::invalid("assigned orders cannot stay in the requested state"));
    }

    let mut tx = db.begin().await?;
    let result = assign_in(&mut tx, &assignment, target).await;
    let assigned = finish(tx, result).await?;

    log::info!(
        "{} order(s) assigned to branch {} as {}",
        assigned,
        assignment.branch_id,
        target
    );
    Ok(assigned)
}

async fn assign_in(conn: &mut PgConnection, assignment: &Assignment, target: OrderStatus) -> StockResult<usize> {
    ensure_active_branch(conn, assignment.branch_id).await?;

    let mut routed = Vec::new();
    let mut demands = Vec::new();
    for order_id in sorted_unique(&assignment.order_ids) {
        let Some(order) = lock_order(conn, order_id).await? else {
            log::debug!("Order {} vanished before assignment", order_id);
            continue;
        };
        if order.branch_id.is_some() {
            log::debug!("Order {} already routed, skipping", order_id);
            continue;
        }
        if !order.status.can_reach(target) {
            return Err(StockError::invalid(format!(
                "order {} cannot move from {} to {}",
                order_id, order.status, target
            )));
        }
        if target.consumes_stock() && !order.status.consumes_stock() {
            let requests = order_requests(conn, order_id).await?;
            demands.extend(requests.into_iter().map(|r| (assignment.branch_id, r)));
        }

        let discount = assignment.discount_type.amount(order.subtotal, assignment.discount);
        let total = order.subtotal + order.tax - discount + assignment.delivery_fee;
        if total < Decimal::ZERO {
            return Err(StockError::invalid(format!("discount exceeds the total of order {}", order_id)));
        }
        routed.push((order_id, total));
    }

    gate::enforce_by_branch(conn, demands).await?;

    for &(order_id, total) in &routed {
        sqlx::query(
            r#"
            UPDATE orders
            SET branch_id = $1, discount = $2, discount_type = $3, delivery_fee = $4, total = $5,
                status = $6, updated_by = $7, updated_at = NOW()
            WHERE id = $8
            "#,
        )
        .bind(assignment.branch_id)
        .bind(assignment.discount)
        .bind(assignment.discount_type.as_str())
        .bind(assignment.delivery_fee)
        .bind(total)
        .bind(target.as_str())
        .bind(assignment.assigned_by)
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(routed.len())
}

/// Bulk status change. All orders move or none do.
///
/// An order entering `ready`/`shipped`/`completed` from a non-consuming
/// status starts counting against its branch, so that step is gated.
pub async fn update_order_status(
    db: &Database,
    order_ids: &[Uuid],
    status: OrderStatus,
    actor_id: Uuid,
    access: &BranchAccess,
) -> StockResult<usize> {
    if order_ids.is_empty() {
        return Err(StockError::invalid("no orders selected"));
    }

    let mut tx = db.begin().await?;
    let result = set_order_status(&mut tx, order_ids, status, actor_id, access).await;
    let updated = finish(tx, result).await?;

    log::info!("{} order(s) moved to {}", updated, status);
    Ok(updated)
}

async fn set_order_status(
    conn: &mut PgConnection,
    order_ids: &[Uuid],
    status: OrderStatus,
    actor_id: Uuid,
    access: &BranchAccess,
) -> StockResult<usize> {
    let ids = sorted_unique(order_ids);
    let mut demands = Vec::new();
    for &order_id in &ids {
        let order = lock_order(conn, order_id)
            .await?
            .ok_or(StockError::NotFound("order"))?;

        ensure_order_access(&order, access)?;

        if order.status.is_terminal() && order.status != status {
            return Err(StockError::invalid(format!("order {} is already {}", order_id, order.status)));
        }
        if !order.status.can_reach(status) {
            return Err(StockError::invalid(format!(
                "order {} cannot move from {} to {}",
                order_id, order.status, status
            )));
        }

        if status.consumes_stock() && !order.status.consumes_stock() {
            let branch_id = order.branch_id.ok_or_else(|| {
                StockError::invalid(format!("order {} must be assigned to a branch first", order_id))
            })?;
            let requests = order_requests(conn, order_id).await?;
            demands.extend(requests.into_iter().map(|r| (branch_id, r)));
        }
    }

    // Orders at different branches are gated together under one lock pass.
    gate::enforce_by_branch(conn, demands).await?;

    sqlx::query("UPDATE orders SET status = $1, updated_by = $2, updated_at = NOW() WHERE id = ANY($3)")
        .bind(status.as_str())
        .bind(actor_id)
        .bind(&ids)
        .execute(&mut *conn)
        .await?;
    Ok(ids.len())
}

/// Replaces an order's lines and money fields. An order already counting
/// against its branch is gated again with its old lines out of the ledger.
pub async fn edit_order_lines(
    db: &Database,
    order_id: Uuid,
    edit: OrderEdit,
    access: &BranchAccess,
) -> StockResult<Order> {
    validate_lines(&edit.lines)?;
    ensure_non_negative(edit.tax, "tax")?;
    ensure_non_negative(edit.discount, "discount")?;
    ensure_non_negative(edit.delivery_fee, "delivery fee")?;

    let mut tx = db.begin().await?;
    let result = rewrite_order(&mut tx, order_id, &edit, access).await;
    let order = finish(tx, result).await.map_err(|err| {
        if let StockError::InsufficientStock(v) = &err {
            log::warn!("Edit of order {} rejected: {} item(s) short", order_id, v.len());
        }
        err
    })?;

    log::info!("Order {} edited ({} line(s))", order_id, edit.lines.len());
    Ok(order)
}

async fn rewrite_order(
    conn: &mut PgConnection,
    order_id: Uuid,
    edit: &OrderEdit,
    access: &BranchAccess,
) -> StockResult<Order> {
    let order = lock_order(conn, order_id)
        .await?
        .ok_or(StockError::NotFound("order"))?;
    ensure_order_access(&order, access)?;
    if order.status == OrderStatus::Cancelled {
        return Err(StockError::invalid(format!("order {} is cancelled", order_id)));
    }

    sqlx::query("DELETE FROM order_items WHERE order_id = $1")
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
    if order.status.consumes_stock() {
        let branch_id = order.branch_id.ok_or_else(|| {
            StockError::invalid(format!("order {} has no branch", order_id))
        })?;
        gate::enforce(
            conn,
            StockScope::Branch(branch_id),
            edit.lines.iter().map(LineItem::request),
        )
        .await?;
    }

    let lines = price_lines(conn, &edit.lines).await?;
    let subtotal = total_of(&lines);
    let total = subtotal + edit.tax - edit.discount_type.amount(subtotal, edit.discount) + edit.delivery_fee;
    if total < Decimal::ZERO {
        return Err(StockError::invalid("discount exceeds the order total"));
    }
    insert_items(conn, "order_items", "order_id", order_id, &lines).await?;

    Ok(sqlx::query_as::<_, Order>(
        r#"
        UPDATE orders
        SET subtotal = $1, tax = $2, discount = $3, discount_type = $4, delivery_fee = $5,
            total = $6, notes = $7, updated_by = $8, updated_at = NOW()
        WHERE id = $9
        RETURNING *
        "#,
    )
    .bind(subtotal)
    .bind(edit.tax)
    .bind(edit.discount)
    .bind(edit.discount_type.as_str())
    .bind(edit.delivery_fee)
    .bind(total)
    .bind(&edit.notes)
    .bind(edit.edited_by)
    .bind(order_id)
    .fetch_one(&mut *conn)
    .await?)
}

pub async fn delete_order(db: &Database, order_id: Uuid) -> StockResult<()> {
    let mut tx = db.begin().await?;
    let result = delete_with_items(&mut tx, "order_items", "order_id", "orders", order_id, "order").await;
    finish(tx, result).await?;
    log::info!("Order {} deleted", order_id);
    Ok(())
}

fn batch_number_or_today(batch_number: Option<&str>) -> StockResult<String> {
    let batch_number = match batch_number.map(str::trim) {
        Some(batch) if !batch.is_empty() => batch.to_string(),
        _ => RestockEntry::default_batch_number(Utc::now()),
    };
    if batch_number.len() > 50 {
        return Err(StockError::invalid("batch number is too long"));
    }
    Ok(batch_number)
}

fn ensure_positive_restock(quantity: i32) -> StockResult<()> {
    if quantity <= 0 {
        return Err(StockError::invalid("restock quantity must be positive"));
    }
    Ok(())
}

/// Appends a restock entry, creating the stocking pair if this is the
/// product's first delivery to the branch.
pub async fn record_restock(db: &Database, draft: RestockDraft) -> StockResult<RestockEntry> {
    let batch = RestockBatch {
        branch_id: draft.branch_id,
        lines: vec![RestockLine {
            product_id: draft.product_id,
            quantity: draft.quantity,
            expiry_date: draft.expiry_date,
        }],
        batch_number: draft.batch_number,
    };
    record_restocks(db, batch)
        .await?
        .pop()
        .ok_or(StockError::NotFound("restock"))
}

/// Records a whole delivery in one transaction. Every entry shares the
/// batch number, defaulting to today's.
pub async fn record_restocks(db: &Database, batch: RestockBatch) -> StockResult<Vec<RestockEntry>> {
    if batch.lines.is_empty() {
        return Err(StockError::invalid("no restock lines provided"));
    }
    for line in &batch.lines {
        ensure_positive_restock(line.quantity)?;
    }
    let batch_number = batch_number_or_today(batch.batch_number.as_deref())?;

    let mut lines = batch.lines.clone();
    lines.sort_by_key(|line| line.product_id);

    let mut tx = db.begin().await?;
    let result = insert_restocks(&mut tx, batch.branch_id, &lines, &batch_number).await;
    let entries = finish(tx, result).await?;

    for entry in &entries {
        log::info!(
            "Restocked {} x{} at branch {} (batch {})",
            entry.product_id,
            entry.quantity,
            entry.branch_id,
            entry.batch_number
        );
    }
    Ok(entries)
}

async fn insert_restocks(
    conn: &mut PgConnection,
    branch_id: Uuid,
    lines: &[RestockLine],
    batch_number: &str,
) -> StockResult<Vec<RestockEntry>> {
    let ids = sorted_unique(&lines.iter().map(|l| l.product_id).collect::<Vec<_>>());
    let known = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM products WHERE id = ANY($1)")
        .bind(&ids)
        .fetch_one(&mut *conn)
        .await?;
    if known != ids.len() as i64 {
        return Err(StockError::NotFound("product"));
    }
    ensure_active_branch(conn, branch_id).await?;

    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        touch_pairing(conn, line.product_id, branch_id).await?;
        let entry = sqlx::query_as::<_, RestockEntry>(
            r#"
            INSERT INTO restock (product_id, branch_id, quantity, expiry_date, batch_number)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(line.product_id)
        .bind(branch_id)
        .bind(line.quantity)
        .bind(line.expiry_date)
        .bind(batch_number)
        .fetch_one(&mut *conn)
        .await?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Creates the stocking pair if needed. Touching an existing pairing also
/// takes its row lock, so a restock and a gated commit on the same pair
/// serialize.
async fn touch_pairing(conn: &mut PgConnection, product_id: Uuid, branch_id: Uuid) -> StockResult<()> {
    let pairing = sqlx::query_as::<_, InventoryPairing>(
        r#"
        INSERT INTO inventory (product_id, branch_id) VALUES ($1, $2)
        ON CONFLICT (product_id, branch_id) DO UPDATE SET updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(product_id)
    .bind(branch_id)
    .fetch_one(&mut *conn)
    .await?;
    log::debug!("Touched inventory pairing {}", pairing.id);
    Ok(())
}

async fn lock_restock(conn: &mut PgConnection, restock_id: Uuid) -> StockResult<RestockEntry> {
    sqlx::query_as::<_, RestockEntry>("SELECT * FROM restock WHERE id = $1 FOR UPDATE")
        .bind(restock_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StockError::NotFound("restock"))
}

/// How much stock a restock correction takes away from the entry's
/// original branch.
fn restock_reduction(entry: &RestockEntry, update: &RestockUpdate) -> i64 {
    if update.branch_id == entry.branch_id {
        i64::from(entry.quantity) - i64::from(update.quantity)
    } else {
        i64::from(entry.quantity)
    }
}

/// Corrects a restock entry. Lowering the quantity, or moving the entry
/// to another branch, is refused when the stock it added has already
/// been sold or ordered away.
pub async fn update_restock(db: &Database, restock_id: Uuid, update: RestockUpdate) -> StockResult<RestockEntry> {
    ensure_positive_restock(update.quantity)?;

    let mut tx = db.begin().await?;
    let result = change_restock(&mut tx, restock_id, &update).await;
    let entry = finish(tx, result).await?;

    log::info!(
        "Restock {} corrected to {} x{} at branch {}",
        restock_id,
        entry.product_id,
        entry.quantity,
        entry.branch_id
    );
    Ok(entry)
}

async fn change_restock(conn: &mut PgConnection, restock_id: Uuid, update: &RestockUpdate) -> StockResult<RestockEntry> {
    let entry = lock_restock(conn, restock_id).await?;
    if update.branch_id != entry.branch_id {
        ensure_active_branch(conn, update.branch_id).await?;
    }

    gate::lock_pairs(
        conn,
        &[(entry.product_id, entry.branch_id), (entry.product_id, update.branch_id)],
    )
    .await?;
    let reduction = restock_reduction(&entry, update);
    if reduction > 0 {
        gate::enforce(
            conn,
            StockScope::Branch(entry.branch_id),
            [StockRequest { product_id: entry.product_id, quantity: reduction }],
        )
        .await?;
    }
    touch_pairing(conn, entry.product_id, update.branch_id).await?;

    Ok(sqlx::query_as::<_, RestockEntry>(
        r#"
        UPDATE restock
        SET branch_id = $1, quantity = $2, expiry_date = $3, updated_at = NOW()
        WHERE id = $4
        RETURNING *
        "#,
    )
    .bind(update.branch_id)
    .bind(update.quantity)
    .bind(update.expiry_date)
    .bind(restock_id)
    .fetch_one(&mut *conn)
    .await?)
}

/// Removes a restock entry, unless its stock has already been consumed.
pub async fn delete_restock(db: &Database, restock_id: Uuid) -> StockResult<()> {
    let mut tx = db.begin().await?;
    let result = remove_restock(&mut tx, restock_id).await;
    let entry = finish(tx, result).await?;

    log::info!(
        "Restock {} deleted ({} x{} at branch {})",
        restock_id,
        entry.product_id,
        entry.quantity,
        entry.branch_id
    );
    Ok(())
}

async fn remove_restock(conn: &mut PgConnection, restock_id: Uuid) -> StockResult<RestockEntry> {
    let entry = lock_restock(conn, restock_id).await?;
    gate::enforce(
        conn,
        StockScope::Branch(entry.branch_id),
        [StockRequest { product_id: entry.product_id, quantity: i64::from(entry.quantity) }],
    )
    .await?;

    sqlx::query("DELETE FROM restock WHERE id = $1")
        .bind(restock_id)
        .execute(&mut *conn)
        .await?;
    Ok(entry)
}
