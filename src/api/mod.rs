//! Remote application API: data model and HTTP client.

mod client;
pub mod models;

pub use client::{ApiError, ApplicationApi, CloudClient, VmAction};
pub use models::{AppScope, Application, Vm, VmState};
