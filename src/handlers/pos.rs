use axum::{
    extract::State,
    response::Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_cookies::Cookies;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath, ApiQuery};
use crate::{
    error::StockResult,
    middleware::{require_user, STAFF},
    models::{DiscountType, PaymentMethod, PaymentStatus},
    stock::{commit_sale, list_sellable_products, BranchStockItem, RawLines, SaleDraft, StockFilter},
    AppState,
};

#[derive(Deserialize)]
pub struct ProductQuery {
    search: Option<String>,
}

pub async fn pos_products(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(branch_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<ProductQuery>,
) -> StockResult<Json<Vec<BranchStockItem>>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    user.require_branch(branch_id)?;

    let filter = StockFilter { search: query.search, ..Default::default() };
    Ok(Json(list_sellable_products(&state.db, branch_id, &filter).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRequest {
    branch_id: Uuid,
    customer_id: Option<Uuid>,
    items: RawLines,
    #[serde(default)]
    tax: Decimal,
    #[serde(default)]
    discount: Decimal,
    #[serde(default)]
    discount_type: DiscountType,
    payment_method: PaymentMethod,
    #[serde(default)]
    payment_status: PaymentStatus,
    notes: Option<String>,
}

pub async fn create_sale(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<SaleRequest>,
) -> StockResult<Json<Value>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    user.require_branch(body.branch_id)?;

    let draft = SaleDraft {
        branch_id: body.branch_id,
        employee_id: user.id,
        customer_id: body.customer_id,
        lines: body.items.parse()?,
        tax: body.tax,
        discount: body.discount,
        discount_type: body.discount_type,
        payment_method: body.payment_method,
        payment_status: body.payment_status,
        notes: body.notes,
    };
    let sale_id = commit_sale(&state.db, draft).await?;

    Ok(Json(json!({
        "success": true,
        "saleId": sale_id,
        "message": "Sale completed successfully",
    })))
}
