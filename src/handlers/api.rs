use axum::{
    extract::State,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath, ApiQuery};
use crate::{
    error::{StockError, StockResult},
    middleware::{require_user, CurrentUser},
    models::Role,
    stock::{
        check_availability, get_stock_status, AvailabilityReport, BandPolicy, CustomerAvailability,
        RawLines, StockReport, StockScope,
    },
    AppState,
};

const ANYONE: &[Role] = &[Role::Admin, Role::Employee, Role::Customer];

#[derive(Deserialize)]
pub struct StatusQuery {
    policy: Option<BandPolicy>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockStatusResponse {
    #[serde(flatten)]
    report: StockReport,
    availability: CustomerAvailability,
}

fn default_policy(user: &CurrentUser) -> BandPolicy {
    if user.is_staff() {
        BandPolicy::ExactBand
    } else {
        BandPolicy::WithinBand
    }
}

// Staff are limited to their branches; customers may look at any branch.
fn check_branch(user: &CurrentUser, branch_id: Uuid) -> StockResult<()> {
    if user.is_staff() {
        user.require_branch(branch_id)?;
    }
    Ok(())
}

pub async fn stock_status(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiPath((product_id, branch_id)): ApiPath<(Uuid, Uuid)>,
    ApiQuery(query): ApiQuery<StatusQuery>,
) -> StockResult<Json<StockStatusResponse>> {
    let user = require_user(&cookies, &state, ANYONE).await?;
    check_branch(&user, branch_id)?;

    let policy = query.policy.unwrap_or_else(|| default_policy(&user));
    let report = get_stock_status(&state.db, product_id, branch_id, policy).await?;
    let availability = CustomerAvailability::from_stock(report.available, report.floor_level);

    Ok(Json(StockStatusResponse { report, availability }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    /// Omitted for carts that have not been routed to a branch.
    branch_id: Option<Uuid>,
    items: RawLines,
}

pub async fn check_stock(
    State(state): State<AppState>,
    cookies: Cookies,
    ApiJson(body): ApiJson<CheckRequest>,
) -> StockResult<Json<AvailabilityReport>> {
    let user = require_user(&cookies, &state, ANYONE).await?;
    if let Some(branch_id) = body.branch_id {
        check_branch(&user, branch_id)?;
    } else if user.role == Role::Employee {
        return Err(StockError::invalid("branch is required"));
    }

    let requests: Vec<_> = body.items.parse()?.iter().map(|line| line.request()).collect();
    let report = check_availability(&state.db, StockScope::from(body.branch_id), &requests).await?;

    Ok(Json(report))
}
