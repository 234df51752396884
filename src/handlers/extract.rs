//! `Json`, `Query` and `Path` wrappers whose rejections are `StockError`s,
//! so malformed bodies, query strings and ids get the JSON error body.

use axum::extract::{FromRequest, FromRequestParts, Json, Path, Query};

use crate::error::StockError;

#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(StockError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(Query), rejection(StockError))]
pub struct ApiQuery<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(Path), rejection(StockError))]
pub struct ApiPath<T>(pub T);
