//! OpenAPI documentation for the admin API at `/admin/api/v1/*`, served as JSON from
//! `/admin/api/v1/openapi.json`.

pub mod admin;

pub use admin::AdminApiDoc;
