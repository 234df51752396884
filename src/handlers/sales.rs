use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath};
use crate::{
    error::StockResult,
    middleware::require_user,
    models::{DiscountType, PaymentMethod, PaymentStatus, Role, Sale},
    stock::{delete_sale as remove_sale, edit_sale as rewrite_sale, update_payment_status, RawLines, SaleEdit},
    AppState,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusRequest {
    payment_status: PaymentStatus,
}

pub async fn set_payment_status(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(sale_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<PaymentStatusRequest>,
) -> StockResult<Json<Sale>> {
    require_user(&cookies, &state, &[Role::Admin]).await?;
    Ok(Json(update_payment_status(&state.db, sale_id, body.payment_status).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleEditRequest {
    items: RawLines,
    #[serde(default)]
    tax: Decimal,
    #[serde(default)]
    discount: Decimal,
    #[serde(default)]
    discount_type: DiscountType,
    payment_method: PaymentMethod,
    notes: Option<String>,
}

pub async fn edit_sale(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(sale_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<SaleEditRequest>,
) -> StockResult<Json<Sale>> {
    require_user(&cookies, &state, &[Role::Admin]).await?;

    let edit = SaleEdit {
        lines: body.items.parse()?,
        tax: body.tax,
        discount: body.discount,
        discount_type: body.discount_type,
        payment_method: body.payment_method,
        notes: body.notes,
    };
    Ok(Json(rewrite_sale(&state.db, sale_id, edit).await?))
}

pub async fn delete_sale(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(sale_id): ApiPath<Uuid>,
) -> StockResult<StatusCode> {
    require_user(&cookies, &state, &[Role::Admin]).await?;
    remove_sale(&state.db, sale_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
