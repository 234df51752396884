use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_cookies::Cookies;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath, ApiQuery};
use crate::{
    error::{StockError, StockResult},
    middleware::{require_user, STAFF},
    models::{DiscountType, Order, OrderStatus, OrderType, Role},
    stock::{
        assign_orders, commit_order, delete_order as remove_order, edit_order_lines,
        list_incoming_orders, update_order_status, Assignment, DeliveryDetails, IncomingFilter,
        LineItem, OrderDraft, OrderEdit, Page, PageRequest, RawLines, TaxPolicy,
    },
    AppState,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFields {
    delivery_address: Option<String>,
    delivery_city: Option<String>,
    delivery_state: Option<String>,
    delivery_zip: Option<String>,
}

impl From<DeliveryFields> for DeliveryDetails {
    fn from(fields: DeliveryFields) -> Self {
        Self {
            address: fields.delivery_address,
            city: fields.delivery_city,
            state: fields.delivery_state,
            zip: fields.delivery_zip,
        }
    }
}

fn created(order_id: Uuid, message: &str) -> Json<Value> {
    Json(json!({
        "success": true,
        "orderId": order_id,
        "message": message,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffOrderRequest {
    customer_id: Uuid,
    branch_id: Uuid,
    order_type: OrderType,
    status: Option<OrderStatus>,
    items: RawLines,
    #[serde(default)]
    tax: Decimal,
    #[serde(default)]
    discount: Decimal,
    #[serde(default)]
    discount_type: DiscountType,
    #[serde(default)]
    delivery_fee: Decimal,
    #[serde(flatten)]
    delivery: DeliveryFields,
    notes: Option<String>,
}

/// Staff-entered order for a branch they operate.
pub async fn create_order(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<StaffOrderRequest>,
) -> StockResult<Json<Value>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    user.require_branch(body.branch_id)?;

    let draft = OrderDraft {
        customer_id: body.customer_id,
        branch_id: Some(body.branch_id),
        order_type: body.order_type,
        status: body.status.unwrap_or(OrderStatus::Pending),
        lines: body.items.parse()?,
        tax: TaxPolicy::Amount(body.tax),
        discount: body.discount,
        discount_type: body.discount_type,
        delivery_fee: body.delivery_fee,
        delivery: body.delivery.into(),
        notes: body.notes,
        created_by: user.id,
    };
    let order_id = commit_order(&state.db, draft).await?;

    Ok(created(order_id, "Order created successfully"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerOrderRequest {
    order_type: OrderType,
    items: RawLines,
    #[serde(flatten)]
    delivery: DeliveryFields,
    notes: Option<String>,
}

/// Customer checkout. Prices always come from the catalog and the order
/// waits in the incoming queue until staff route it to a branch.
pub async fn submit_order(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<CustomerOrderRequest>,
) -> StockResult<Json<Value>> {
    let user = require_user(&cookies, &state, &[Role::Customer]).await?;

    let lines = body
        .items
        .parse()?
        .into_iter()
        .map(|line| LineItem { unit_price: None, subtotal: None, ..line })
        .collect();

    let draft = OrderDraft {
        customer_id: user.id,
        branch_id: None,
        order_type: body.order_type,
        status: OrderStatus::Requested,
        lines,
        tax: TaxPolicy::Rate(state.config.order_tax_rate),
        discount: Decimal::ZERO,
        discount_type: DiscountType::Fixed,
        delivery_fee: Decimal::ZERO,
        delivery: body.delivery.into(),
        notes: body.notes,
        created_by: user.id,
    };
    let order_id = commit_order(&state.db, draft).await?;

    Ok(created(order_id, "Order placed successfully"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingQuery {
    order_type: Option<OrderType>,
    search: Option<String>,
    page: Option<u32>,
}

pub async fn incoming_orders(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiQuery(query): ApiQuery<IncomingQuery>,
) -> StockResult<Json<Page<Order>>> {
    require_user(&cookies, &state, STAFF).await?;

    let filter = IncomingFilter { order_type: query.order_type, search: query.search };
    let page = PageRequest::new(query.page, state.config.page_size);

    Ok(Json(list_incoming_orders(&state.db, &filter, page).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    order_ids: Vec<Uuid>,
    branch_id: Uuid,
    #[serde(default)]
    discount: Decimal,
    #[serde(default)]
    discount_type: DiscountType,
    #[serde(default)]
    delivery_fee: Decimal,
    status: Option<OrderStatus>,
}

pub async fn assign_incoming(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<AssignRequest>,
) -> StockResult<Json<Value>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    user.require_staff_at(body.branch_id)?;

    let assigned = assign_orders(
        &state.db,
        Assignment {
            order_ids: body.order_ids,
            branch_id: body.branch_id,
            discount: body.discount,
            discount_type: body.discount_type,
            delivery_fee: body.delivery_fee,
            status: body.status,
            assigned_by: user.id,
        },
    )
    .await?;

    Ok(Json(json!({
        "success": true,
        "assigned": assigned,
        "message": format!("{} order(s) assigned", assigned),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    order_ids: Vec<Uuid>,
    status: OrderStatus,
}

pub async fn update_status(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<StatusRequest>,
) -> StockResult<Json<Value>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    if body.status == OrderStatus::Requested {
        return Err(StockError::invalid("orders cannot be moved back to requested"));
    }

    let updated = update_order_status(&state.db, &body.order_ids, body.status, user.id, &user.branch_access).await?;

    Ok(Json(json!({
        "success": true,
        "updated": updated,
        "message": format!("{} order(s) updated", updated),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEditRequest {
    items: RawLines,
    #[serde(default)]
    tax: Decimal,
    #[serde(default)]
    discount: Decimal,
    #[serde(default)]
    discount_type: DiscountType,
    #[serde(default)]
    delivery_fee: Decimal,
    notes: Option<String>,
}

pub async fn edit_order(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(order_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<OrderEditRequest>,
) -> StockResult<Json<Order>> {
    let user = require_user(&cookies, &state, STAFF).await?;

    let edit = OrderEdit {
        lines: body.items.parse()?,
        tax: body.tax,
        discount: body.discount,
        discount_type: body.discount_type,
        delivery_fee: body.delivery_fee,
        notes: body.notes,
        edited_by: user.id,
    };
    Ok(Json(edit_order_lines(&state.db, order_id, edit, &user.branch_access).await?))
}

pub async fn delete_order(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(order_id): ApiPath<Uuid>,
) -> StockResult<StatusCode> {
    require_user(&cookies, &state, &[Role::Admin]).await?;
    remove_order(&state.db, order_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
