use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath, ApiQuery};
use crate::{
    error::{StockError, StockResult},
    middleware::{require_user, STAFF},
    models::{RestockEntry, Role},
    stock::{
        delete_restock, list_batch_numbers, list_branch_stock, list_restocks, low_stock_alerts,
        record_restock, record_restocks, update_restock, BranchStockItem, Page, PageRequest,
        RestockBatch, RestockDraft, RestockFilter, RestockLine, RestockListItem, RestockUpdate,
        StockFilter, StockStatusFilter,
    },
    AppState,
};

#[derive(Deserialize)]
pub struct StockQuery {
    search: Option<String>,
    /// Comma-separated category ids.
    category: Option<String>,
    status: Option<StockStatusFilter>,
    page: Option<u32>,
}

fn parse_categories(raw: Option<&str>) -> StockResult<Vec<Uuid>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| Uuid::parse_str(id).map_err(|_| StockError::invalid(format!("invalid category id: {}", id))))
        .collect()
}

pub async fn branch_stock(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(branch_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<StockQuery>,
) -> StockResult<Json<Page<BranchStockItem>>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    user.require_branch(branch_id)?;

    let filter = StockFilter {
        search: query.search,
        category_ids: parse_categories(query.category.as_deref())?,
        status: query.status,
    };
    let page = PageRequest::new(query.page, state.config.page_size);

    Ok(Json(list_branch_stock(&state.db, branch_id, &filter, page).await?))
}

pub async fn stock_alerts(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(branch_id): ApiPath<Uuid>,
) -> StockResult<Json<Vec<BranchStockItem>>> {
    let user = require_user(&cookies, &state, STAFF).await?;
    user.require_branch(branch_id)?;

    Ok(Json(low_stock_alerts(&state.db, branch_id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockRequest {
    product_id: Uuid,
    branch_id: Uuid,
    quantity: i32,
    expiry_date: NaiveDate,
    batch_number: Option<String>,
}

pub async fn create_restock(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<RestockRequest>,
) -> StockResult<Json<RestockEntry>> {
    require_user(&cookies, &state, &[Role::Admin]).await?;

    let entry = record_restock(
        &state.db,
        RestockDraft {
            product_id: body.product_id,
            branch_id: body.branch_id,
            quantity: body.quantity,
            expiry_date: body.expiry_date,
            batch_number: body.batch_number,
        },
    )
    .await?;

    Ok(Json(entry))
}

#[derive(Deserialize)]
pub struct RestockQuery {
    search: Option<String>,
    /// Comma-separated category ids.
    category: Option<String>,
    batch: Option<String>,
    page: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockHistory {
    #[serde(flatten)]
    page: Page<RestockListItem>,
    batch_numbers: Vec<String>,
}

pub async fn restock_history(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(branch_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<RestockQuery>,
) -> StockResult<Json<RestockHistory>> {
    require_user(&cookies, &state, &[Role::Admin]).await?;

    let filter = RestockFilter {
        search: query.search,
        category_ids: parse_categories(query.category.as_deref())?,
        batch_number: query.batch,
    };
    let page = PageRequest::new(query.page, state.config.page_size);

    Ok(Json(RestockHistory {
        page: list_restocks(&state.db, branch_id, &filter, page).await?,
        batch_numbers: list_batch_numbers(&state.db, branch_id).await?,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockItem {
    product_id: Uuid,
    quantity: i32,
    expiry_date: NaiveDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniformRestock {
    product_ids: Vec<Uuid>,
    quantity: i32,
    expiry_date: NaiveDate,
}

/// Either one line per product, or several products sharing a quantity
/// and expiry date.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum BulkLines {
    Items { items: Vec<RestockItem> },
    Uniform(UniformRestock),
}

impl BulkLines {
    fn into_lines(self) -> Vec<RestockLine> {
        match self {
            Self::Items { items } => items
                .into_iter()
                .map(|item| RestockLine {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    expiry_date: item.expiry_date,
                })
                .collect(),
            Self::Uniform(uniform) => uniform
                .product_ids
                .into_iter()
                .map(|product_id| RestockLine {
                    product_id,
                    quantity: uniform.quantity,
                    expiry_date: uniform.expiry_date,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRestockRequest {
    branch_id: Uuid,
    batch_number: Option<String>,
    #[serde(flatten)]
    lines: BulkLines,
}

pub async fn create_restock_batch(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<BulkRestockRequest>,
) -> StockResult<Json<Vec<RestockEntry>>> {
    require_user(&cookies, &state, &[Role::Admin]).await?;

    let entries = record_restocks(
        &state.db,
        RestockBatch {
            branch_id: body.branch_id,
            lines: body.lines.into_lines(),
            batch_number: body.batch_number,
        },
    )
    .await?;

    Ok(Json(entries))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockUpdateRequest {
    branch_id: Uuid,
    quantity: i32,
    expiry_date: NaiveDate,
}

pub async fn edit_restock(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(restock_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<RestockUpdateRequest>,
) -> StockResult<Json<RestockEntry>> {
    require_user(&cookies, &state, &[Role::Admin]).await?;

    let update = RestockUpdate {
        branch_id: body.branch_id,
        quantity: body.quantity,
        expiry_date: body.expiry_date,
    };
    Ok(Json(update_restock(&state.db, restock_id, update).await?))
}

pub async fn remove_restock(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath(restock_id): ApiPath<Uuid>,
) -> StockResult<StatusCode> {
    require_user(&cookies, &state, &[Role::Admin]).await?;
    delete_restock(&state.db, restock_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
