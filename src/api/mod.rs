pub mod core;
mod notifications;

use rocket::serde::json::Json;
use serde_json::Value;

pub use crate::api::{
    core::routes as core_routes,
    core::{audit_cleanup_job, counter_sweep_job, status_sweep_job},
    notifications::routes as notifications_routes,
    notifications::{UpdateType, WS_EVENTS},
};

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<Json<Value>>;
pub type EmptyResult = ApiResult<()>;
