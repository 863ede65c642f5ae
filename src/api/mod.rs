//! Projects REST API: wire types, transport and the cached client.

mod error;
pub mod patches;
mod projects;
mod sse;
mod transport;
mod types;

pub use error::ApiError;
pub use projects::{
  ProjectApi, DELETED_PROJECTS, HEALTHS, OWNERS, PROJECT, PROJECTS, STATUSES, TAG_CHOICES,
};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
pub use types::{
  BulkResult, BulkUpdate, PageParams, Project, ProjectChanges, ProjectFilters, ProjectPage,
};
