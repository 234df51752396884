use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    database::Database,
    error::{StockError, StockResult},
    models::{OrderStatus, PaymentStatus},
};

/// Distance from the floor level that marks a product as critical.
pub const CRITICAL_BAND: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Reorder,
    Critical,
    InStock,
}

/// How the critical band around the floor level is matched.
///
/// Staff screens flag only an exact distance of [`CRITICAL_BAND`]; the
/// storefront warns for anything within it. Callers pick one explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPolicy {
    #[default]
    ExactBand,
    WithinBand,
}

impl BandPolicy {
    pub fn hits(self, available: i64, floor_level: i32) -> bool {
        let diff = (available - i64::from(floor_level)).abs();
        match self {
            Self::ExactBand => diff == CRITICAL_BAND,
            Self::WithinBand => diff <= CRITICAL_BAND,
        }
    }
}

/// Nothing on hand is always Reorder. Otherwise a band hit is Critical,
/// and anything left below the floor is Reorder.
pub fn classify(available: i64, floor_level: i32, policy: BandPolicy) -> StockStatus {
    if available <= 0 {
        StockStatus::Reorder
    } else if policy.hits(available, floor_level) {
        StockStatus::Critical
    } else if available < i64::from(floor_level) {
        StockStatus::Reorder
    } else {
        StockStatus::InStock
    }
}

/// Storefront badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerAvailability {
    SoldOut,
    Limited,
    Available,
}

impl CustomerAvailability {
    pub fn from_stock(available: i64, floor_level: i32) -> Self {
        if available <= 0 {
            return Self::SoldOut;
        }
        match classify(available, floor_level, BandPolicy::WithinBand) {
            StockStatus::InStock => Self::Available,
            StockStatus::Reorder | StockStatus::Critical => Self::Limited,
        }
    }
}

/// The three ledger sums behind one (product, scope) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct LedgerTotals {
    pub restocked: i64,
    /// Order lines whose order sits in a consuming status.
    pub ordered: i64,
    /// Sale lines whose sale is paid.
    pub sold: i64,
}

impl LedgerTotals {
    pub fn available(&self) -> i64 {
        self.restocked - self.ordered - self.sold
    }
}

/// Which branches' ledgers count toward availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockScope {
    Branch(Uuid),
    /// Network-wide stock, used for orders that have no branch yet.
    AllBranches,
}

impl StockScope {
    pub fn branch_id(self) -> Option<Uuid> {
        match self {
            Self::Branch(id) => Some(id),
            Self::AllBranches => None,
        }
    }
}

impl From<Option<Uuid>> for StockScope {
    fn from(branch_id: Option<Uuid>) -> Self {
        branch_id.map_or(Self::AllBranches, Self::Branch)
    }
}

/// How the ledger subqueries are tied to a branch.
pub(crate) enum BranchMatch<'c> {
    /// Correlated with a column of the outer query.
    Column(&'c str),
    Value(Uuid),
    Any,
}

impl<'c> From<StockScope> for BranchMatch<'c> {
    fn from(scope: StockScope) -> Self {
        match scope {
            StockScope::Branch(id) => Self::Value(id),
            StockScope::AllBranches => Self::Any,
        }
    }
}

fn push_branch_match(qb: &mut QueryBuilder<'_, Postgres>, column: &str, branch: &BranchMatch<'_>) {
    match branch {
        BranchMatch::Column(outer) => {
            qb.push(format!(" AND {} = {}", column, outer));
        }
        BranchMatch::Value(id) => {
            qb.push(format!(" AND {} = ", column));
            qb.push_bind(*id);
        }
        BranchMatch::Any => {}
    }
}

/// Pushes `restocked, ordered, sold` select columns for `product_column`.
/// Consuming statuses are bound from the enums, never spliced.
pub(crate) fn push_ledger_sums(
    qb: &mut QueryBuilder<'_, Postgres>,
    product_column: &str,
    branch: &BranchMatch<'_>,
) {
    qb.push(format!(
        "COALESCE((SELECT SUM(r.quantity) FROM restock r WHERE r.product_id = {}",
        product_column
    ));
    push_branch_match(qb, "r.branch_id", branch);
    qb.push("), 0)::BIGINT AS restocked, ");

    qb.push(format!(
        "COALESCE((SELECT SUM(oi.quantity) FROM order_items oi \
         JOIN orders o ON oi.order_id = o.id WHERE oi.product_id = {}",
        product_column
    ));
    push_branch_match(qb, "o.branch_id", branch);
    qb.push(" AND o.status = ANY(");
    qb.push_bind(OrderStatus::consuming());
    qb.push(")), 0)::BIGINT AS ordered, ");

    qb.push(format!(
        "COALESCE((SELECT SUM(si.quantity) FROM sale_items si \
         JOIN sales s ON si.sale_id = s.id WHERE si.product_id = {}",
        product_column
    ));
    push_branch_match(qb, "s.branch_id", branch);
    qb.push(" AND s.payment_status = ANY(");
    qb.push_bind(PaymentStatus::consuming());
    qb.push(")), 0)::BIGINT AS sold");
}

#[derive(Debug, FromRow)]
pub(crate) struct ProductTotals {
    pub product_id: Uuid,
    pub floor_level: i32,
    #[sqlx(flatten)]
    pub totals: LedgerTotals,
}

/// One batched read of the ledgers for every product in `product_ids`.
/// Unknown products are simply absent from the result.
pub(crate) async fn load_totals(
    conn: &mut PgConnection,
    scope: StockScope,
    product_ids: &[Uuid],
) -> StockResult<HashMap<Uuid, ProductTotals>> {
    if product_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut qb = QueryBuilder::new("SELECT p.id AS product_id, p.floor_level, ");
    push_ledger_sums(&mut qb, "p.id", &scope.into());
    qb.push(" FROM products p WHERE p.id = ANY(");
    qb.push_bind(product_ids.to_vec());
    qb.push(")");

    let rows = qb
        .build_query_as::<ProductTotals>()
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows.into_iter().map(|row| (row.product_id, row)).collect())
}

pub async fn compute_available(
    conn: &mut PgConnection,
    product_id: Uuid,
    scope: StockScope,
) -> StockResult<i64> {
    load_totals(conn, scope, &[product_id])
        .await?
        .get(&product_id)
        .map(|row| row.totals.available())
        .ok_or(StockError::NotFound("product"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReport {
    pub product_id: Uuid,
    pub branch_id: Uuid,
    pub available: i64,
    pub floor_level: i32,
    pub status: StockStatus,
}

pub async fn get_stock_status(
    db: &Database,
    product_id: Uuid,
    branch_id: Uuid,
    policy: BandPolicy,
) -> StockResult<StockReport> {
    let mut conn = db.acquire().await?;

    let branch_exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM branches WHERE id = $1)")
        .bind(branch_id)
        .fetch_one(&mut *conn)
        .await?;
    if !branch_exists {
        return Err(StockError::NotFound("branch"));
    }

    let totals = load_totals(&mut conn, StockScope::Branch(branch_id), &[product_id]).await?;
    let row = totals.get(&product_id).ok_or(StockError::NotFound("product"))?;
    let available = row.totals.available();

    Ok(StockReport {
        product_id,
        branch_id,
        available,
        floor_level: row.floor_level,
        status: classify(available, row.floor_level, policy),
    })
}
