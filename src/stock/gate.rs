use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
};
use uuid::Uuid;

use super::calculator::{load_totals, StockScope};
use crate::{
    database::Database,
    error::{StockError, StockResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub product_id: Uuid,
    pub requested: i64,
    pub available: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockRequest {
    pub product_id: Uuid,
    pub quantity: i64,
}

/// A validated cart/sale line. Prices left out are filled from the
/// product's current price at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Option<Decimal>,
    pub subtotal: Option<Decimal>,
}

impl LineItem {
    pub fn request(&self) -> StockRequest {
        StockRequest {
            product_id: self.product_id,
            quantity: i64::from(self.quantity),
        }
    }
}

/// A line as submitted by a client, before validation. Numbers may arrive
/// as JSON numbers or numeric strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLineItem {
    #[serde(default)]
    pub product_id: Value,
    #[serde(default)]
    pub quantity: Value,
    #[serde(default)]
    pub unit_price: Option<Value>,
    #[serde(default)]
    pub subtotal: Option<Value>,
}

/// POS forms post the cart as a JSON-encoded string; API clients post an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLines {
    Lines(Vec<RawLineItem>),
    Encoded(String),
}

impl RawLines {
    pub fn parse(&self) -> StockResult<Vec<LineItem>> {
        match self {
            Self::Lines(lines) => parse_lines(lines),
            Self::Encoded(json) => {
                let lines: Vec<RawLineItem> = serde_json::from_str(json)
                    .map_err(|e| StockError::invalid(format!("line items are not valid JSON: {}", e)))?;
                parse_lines(&lines)
            }
        }
    }
}

pub fn parse_lines(raw: &[RawLineItem]) -> StockResult<Vec<LineItem>> {
    if raw.is_empty() {
        return Err(StockError::invalid("no line items provided"));
    }
    raw.iter()
        .enumerate()
        .map(|(index, line)| parse_line(index, line))
        .collect()
}

fn parse_line(index: usize, raw: &RawLineItem) -> StockResult<LineItem> {
    let product_id = match &raw.product_id {
        Value::String(s) => Uuid::parse_str(s.trim()).ok(),
        _ => None,
    }
    .ok_or_else(|| StockError::invalid(format!("line {}: unparseable product id", index + 1)))?;

    let quantity = parse_quantity(&raw.quantity)
        .ok_or_else(|| StockError::invalid(format!("line {}: quantity must be a positive integer", index + 1)))?;

    let unit_price = parse_money(raw.unit_price.as_ref(), index, "unit price")?;
    let subtotal = parse_money(raw.subtotal.as_ref(), index, "subtotal")?;

    Ok(LineItem { product_id, quantity, unit_price, subtotal })
}

fn parse_quantity(value: &Value) -> Option<i32> {
    let quantity = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    i32::try_from(quantity).ok().filter(|q| *q > 0)
}

fn parse_money(value: Option<&Value>, index: usize, field: &str) -> StockResult<Option<Decimal>> {
    let text = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(_) => String::new(),
    };
    Decimal::from_str(&text)
        .ok()
        .filter(|amount| !amount.is_sign_negative())
        .map(Some)
        .ok_or_else(|| StockError::invalid(format!("line {}: invalid {}", index + 1, field)))
}

/// Sums requested quantity per distinct product. A product listed on
/// several lines must be checked against its combined quantity.
pub fn aggregate(requests: impl IntoIterator<Item = StockRequest>) -> BTreeMap<Uuid, i64> {
    let mut requested = BTreeMap::new();
    for request in requests {
        *requested.entry(request.product_id).or_insert(0) += request.quantity;
    }
    requested
}

/// Every product whose combined request exceeds what is available.
/// Products missing from `available` count as having none.
pub fn find_violations(requested: &BTreeMap<Uuid, i64>, available: &HashMap<Uuid, i64>) -> Vec<Violation> {
    requested
        .iter()
        .filter_map(|(&product_id, &quantity)| {
            let available = available.get(&product_id).copied().unwrap_or(0);
            (quantity > available).then_some(Violation {
                product_id,
                requested: quantity,
                available,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl AvailabilityReport {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self { ok: violations.is_empty(), violations }
    }

    pub fn into_result(self) -> StockResult<()> {
        if self.ok {
            Ok(())
        } else {
            Err(StockError::InsufficientStock(self.violations))
        }
    }
}

async fn evaluate(
    conn: &mut PgConnection,
    scope: StockScope,
    requested: &BTreeMap<Uuid, i64>,
) -> StockResult<AvailabilityReport> {
    let product_ids: Vec<Uuid> = requested.keys().copied().collect();
    let available: HashMap<Uuid, i64> = load_totals(conn, scope, &product_ids)
        .await?
        .into_iter()
        .map(|(id, row)| (id, row.totals.available()))
        .collect();

    Ok(AvailabilityReport::from_violations(find_violations(requested, &available)))
}

/// Row-locks the stocking pairs of `product_ids` within `scope` for the
/// rest of the transaction, in a fixed order so concurrent commits queue
/// instead of deadlocking.
async fn lock_pairings(conn: &mut PgConnection, scope: StockScope, product_ids: &[Uuid]) -> StockResult<()> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM inventory WHERE product_id = ANY(");
    qb.push_bind(product_ids.to_vec());
    qb.push(")");
    if let Some(branch_id) = scope.branch_id() {
        qb.push(" AND branch_id = ");
        qb.push_bind(branch_id);
    }
    qb.push(" ORDER BY product_id, branch_id FOR UPDATE");

    qb.build().fetch_all(&mut *conn).await?;
    Ok(())
}

/// Row-locks the given `(product_id, branch_id)` pairs that exist, in one
/// statement ordered the same way as `lock_pairings`.
pub(crate) async fn lock_pairs(conn: &mut PgConnection, pairs: &[(Uuid, Uuid)]) -> StockResult<()> {
    let (product_ids, branch_ids): (Vec<Uuid>, Vec<Uuid>) = pairs.iter().copied().unzip();
    sqlx::query(
        r#"
        SELECT i.id
        FROM inventory i
        JOIN UNNEST($1::uuid[], $2::uuid[]) AS d(product_id, branch_id)
          ON i.product_id = d.product_id AND i.branch_id = d.branch_id
        ORDER BY i.product_id, i.branch_id
        FOR UPDATE OF i
        "#,
    )
    .bind(product_ids)
    .bind(branch_ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(())
}

/// Lock, then read availability, inside the caller's transaction. Fails
/// with `InsufficientStock` carrying every violation of the batch.
pub(crate) async fn enforce(
    conn: &mut PgConnection,
    scope: StockScope,
    requests: impl IntoIterator<Item = StockRequest>,
) -> StockResult<()> {
    let requested = aggregate(requests);
    if requested.is_empty() {
        return Ok(());
    }

    let product_ids: Vec<Uuid> = requested.keys().copied().collect();
    lock_pairings(conn, scope, &product_ids).await?;
    evaluate(conn, scope, &requested).await?.into_result()
}

/// Groups per-branch demand and sums each product within its branch.
pub fn aggregate_by_branch(
    demands: impl IntoIterator<Item = (Uuid, StockRequest)>,
) -> BTreeMap<Uuid, BTreeMap<Uuid, i64>> {
    let mut by_branch: BTreeMap<Uuid, Vec<StockRequest>> = BTreeMap::new();
    for (branch_id, request) in demands {
        by_branch.entry(branch_id).or_default().push(request);
    }
    by_branch
        .into_iter()
        .map(|(branch_id, requests)| (branch_id, aggregate(requests)))
        .collect()
}

/// `enforce` for demand spread over several branches. Every pairing is
/// locked in one `(product_id, branch_id)`-ordered statement before any
/// branch is evaluated.
pub(crate) async fn enforce_by_branch(
    conn: &mut PgConnection,
    demands: impl IntoIterator<Item = (Uuid, StockRequest)>,
) -> StockResult<()> {
    let requested = aggregate_by_branch(demands);
    if requested.is_empty() {
        return Ok(());
    }

    let pairs: Vec<(Uuid, Uuid)> = requested
        .iter()
        .flat_map(|(&branch_id, products)| products.keys().map(move |&product_id| (product_id, branch_id)))
        .collect();
    lock_pairs(conn, &pairs).await?;

    let mut violations = Vec::new();
    for (branch_id, products) in &requested {
        violations.extend(evaluate(conn, StockScope::Branch(*branch_id), products).await?.violations);
    }
    AvailabilityReport::from_violations(violations).into_result()
}

/// Read-only availability check for a prospective batch. Insufficient
/// stock is reported in the result, not raised.
pub async fn check_availability(
    db: &Database,
    scope: StockScope,
    requests: &[StockRequest],
) -> StockResult<AvailabilityReport> {
    if requests.is_empty() {
        return Err(StockError::invalid("no line items provided"));
    }
    if requests.iter().any(|r| r.quantity <= 0) {
        return Err(StockError::invalid("quantities must be positive"));
    }

    let mut conn = db.acquire().await?;
    evaluate(&mut conn, scope, &aggregate(requests.iter().copied())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn raw(value: Value) -> Vec<RawLineItem> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_numeric_strings_and_numbers() {
        let id = Uuid::new_v4();
        let lines = parse_lines(&raw(json!([
            { "productId": id.to_string(), "quantity": "3", "unitPrice": "4.50", "subtotal": 13.5 },
            { "productId": id.to_string(), "quantity": 2 }
        ])))
        .unwrap();

        assert_eq!(lines[0].quantity, 3);
        assert_eq!(lines[0].unit_price, Some(dec!(4.50)));
        assert_eq!(lines[0].subtotal, Some(dec!(13.5)));
        assert_eq!(lines[1].unit_price, None);
    }

    #[test]
    fn rejects_malformed_lines() {
        let id = Uuid::new_v4().to_string();
        for bad in [
            json!([{ "productId": "abc", "quantity": 1 }]),
            json!([{ "productId": 7, "quantity": 1 }]),
            json!([{ "productId": id, "quantity": 0 }]),
            json!([{ "productId": id, "quantity": -2 }]),
            json!([{ "productId": id, "quantity": 1.5 }]),
            json!([{ "productId": id, "quantity": "lots" }]),
            json!([{ "productId": id, "quantity": 1, "unitPrice": "-1" }]),
            json!([]),
        ] {
            let result = parse_lines(&raw(bad.clone()));
            assert!(matches!(result, Err(StockError::InvalidRequest(_))), "accepted {}", bad);
        }
    }

    #[test]
    fn encoded_cart_is_decoded() {
        let id = Uuid::new_v4();
        let encoded: RawLines =
            serde_json::from_value(json!(format!(r#"[{{"productId":"{}","quantity":2}}]"#, id))).unwrap();
        let lines = encoded.parse().unwrap();
        assert_eq!(lines, vec![LineItem { product_id: id, quantity: 2, unit_price: None, subtotal: None }]);

        let garbage: RawLines = serde_json::from_value(json!("not json")).unwrap();
        assert!(matches!(garbage.parse(), Err(StockError::InvalidRequest(_))));
    }

    #[test]
    fn scenario_c_reports_the_shortfall() {
        let product = Uuid::new_v4();
        let requested = aggregate([StockRequest { product_id: product, quantity: 10 }]);
        let available = HashMap::from([(product, 5)]);

        let report = AvailabilityReport::from_violations(find_violations(&requested, &available));
        assert!(!report.ok);
        assert_eq!(report.violations, vec![Violation { product_id: product, requested: 10, available: 5 }]);
        assert!(matches!(report.into_result(), Err(StockError::InsufficientStock(v)) if v.len() == 1));
    }

    #[test]
    fn duplicate_lines_are_checked_together() {
        let product = Uuid::new_v4();
        let requested = aggregate([
            StockRequest { product_id: product, quantity: 3 },
            StockRequest { product_id: product, quantity: 4 },
        ]);
        assert_eq!(requested[&product], 7);

        let available = HashMap::from([(product, 5)]);
        let violations = find_violations(&requested, &available);
        assert_eq!(violations, vec![Violation { product_id: product, requested: 7, available: 5 }]);
    }

    #[test]
    fn bulk_demand_is_summed_per_branch() {
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let product = Uuid::from_u128(9);
        let line = |quantity| StockRequest { product_id: product, quantity };

        let grouped = aggregate_by_branch([(b, line(2)), (a, line(3)), (b, line(4))]);
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(grouped[&a][&product], 3);
        assert_eq!(grouped[&b][&product], 6);
        assert!(aggregate_by_branch(Vec::<(Uuid, StockRequest)>::new()).is_empty());
    }

    #[test]
    fn unknown_products_have_nothing_available() {
        let product = Uuid::new_v4();
        let requested = aggregate([StockRequest { product_id: product, quantity: 1 }]);
        let violations = find_violations(&requested, &HashMap::new());
        assert_eq!(violations[0].available, 0);
    }

    #[test]
    fn violation_serializes_camel_case() {
        let product = Uuid::nil();
        let value = serde_json::to_value(Violation { product_id: product, requested: 10, available: 5 }).unwrap();
        assert_eq!(value, json!({ "productId": product, "requested": 10, "available": 5 }));
    }

    proptest! {
        // Splitting a quantity across lines never changes the verdict.
        #[test]
        fn split_lines_match_combined_request(
            parts in prop::collection::vec(1i64..50, 1..6),
            available in 0i64..200,
        ) {
            let product = Uuid::from_u128(42);
            let total: i64 = parts.iter().sum();
            let split = aggregate(parts.iter().map(|&q| StockRequest { product_id: product, quantity: q }));
            let whole = aggregate([StockRequest { product_id: product, quantity: total }]);
            let stock = HashMap::from([(product, available)]);

            prop_assert_eq!(find_violations(&split, &stock), find_violations(&whole, &stock));
            prop_assert_eq!(find_violations(&split, &stock).is_empty(), total <= available);
        }

        // Consulting the gate before every sale keeps stock non-negative.
        #[test]
        fn gated_sales_never_oversell(
            ops in prop::collection::vec((any::<bool>(), 1i64..40), 1..60),
        ) {
            let product = Uuid::from_u128(7);
            let mut restocked = 0i64;
            let mut sold = 0i64;
            for (is_restock, quantity) in ops {
                if is_restock {
                    restocked += quantity;
                    continue;
                }
                let requested = aggregate([StockRequest { product_id: product, quantity }]);
                let stock = HashMap::from([(product, restocked - sold)]);
                if find_violations(&requested, &stock).is_empty() {
                    sold += quantity;
                }
                prop_assert!(restocked - sold >= 0);
            }
        }
    }
}
