//! Projects API on top of the query cache.
//!
//! Reads return subscribed [`Query`] handles backed by shared cache entries.
//! Writes run through the [`MutationExecutor`] with an optimistic patch and
//! the tags each endpoint invalidates.

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use super::error::ApiError;
use super::patches::{add_tag, edit_projects, merge_fields, remove_from_page};
use super::transport::{ApiRequest, Transport};
use super::types::{
  query_pairs, BulkResult, BulkUpdate, PageParams, Project, ProjectChanges, ProjectFilters,
  ProjectPage,
};
use crate::cache::{Fetched, Fetcher, QueryCache, QueryKey, Tag};
use crate::query::Query;
use crate::sync::{Mutation, MutationExecutor};

/// Cache endpoint names.
pub const PROJECTS: &str = "projects";
pub const PROJECT: &str = "project";
pub const DELETED_PROJECTS: &str = "deleted_projects";
pub const OWNERS: &str = "owners";
pub const TAG_CHOICES: &str = "tag_choices";
pub const STATUSES: &str = "statuses";
pub const HEALTHS: &str = "healths";

/// Tags a successful response provides.
type Provides = fn(&Value) -> Vec<Tag>;

#[derive(Clone)]
pub struct ProjectApi {
  transport: Arc<dyn Transport>,
  cache: QueryCache,
  executor: MutationExecutor,
}

impl ProjectApi {
  pub fn new(transport: Arc<dyn Transport>, cache: QueryCache, executor: MutationExecutor) -> Self {
    Self {
      transport,
      cache,
      executor,
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Filtered, paginated project list.
  pub fn projects(&self, filters: &ProjectFilters) -> Query<ProjectPage> {
    let request = ApiRequest::get("projects/").with_query(query_pairs(filters));
    self.query(QueryKey::new(PROJECTS, filters), request, provides_list)
  }

  pub fn project(&self, id: u64) -> Query<Project> {
    let request = ApiRequest::get(format!("projects/{id}/"));
    self.query(QueryKey::new(PROJECT, &id), request, provides_detail)
  }

  /// Soft-deleted projects awaiting recovery.
  pub fn deleted_projects(&self, page: PageParams) -> Query<ProjectPage> {
    let request = ApiRequest::get("projects/deleted/").with_query(query_pairs(&page));
    self.query(QueryKey::new(DELETED_PROJECTS, &page), request, provides_deleted)
  }

  pub fn owners(&self) -> Query<Vec<String>> {
    self.choices(OWNERS, "owners")
  }

  pub fn tag_choices(&self) -> Query<Vec<String>> {
    self.choices(TAG_CHOICES, "tags")
  }

  pub fn statuses(&self) -> Query<Vec<String>> {
    self.choices(STATUSES, "status")
  }

  pub fn healths(&self) -> Query<Vec<String>> {
    self.choices(HEALTHS, "health")
  }

  fn choices(&self, endpoint: &'static str, filter: &str) -> Query<Vec<String>> {
    let request = ApiRequest::get(format!("projects/filters/{filter}/"));
    self.query(QueryKey::bare(endpoint), request, provides_choices)
  }

  fn query<T>(&self, key: QueryKey, request: ApiRequest, provides: Provides) -> Query<T>
  where
    T: DeserializeOwned + 'static,
  {
    let transport = Arc::clone(&self.transport);
    let fetcher: Fetcher = Arc::new(move || {
      let response = transport.send(request.clone());
      async move {
        let data = response.await?.into_result()?;
        check_shape::<T>(&data)?;
        let tags = provides(&data);
        Ok::<_, ApiError>(Fetched::new(data, tags))
      }
      .boxed()
    });
    Query::new(self.cache.subscribe(key, fetcher))
  }

  pub async fn create_project(&self, changes: &ProjectChanges) -> Result<Project, ApiError> {
    let request = ApiRequest::post("projects/", serde_json::to_value(changes)?);
    let mutation = Mutation::new("create_project", [Tag::project_list()]);
    let outcome = self.executor.run(mutation, self.remote(request)).await?;
    decode(&outcome.response)
  }

  /// Partial update guarded by the project's version token when given.
  ///
  /// A stale token fails with [`ApiError::Conflict`]; reload the project
  /// before retrying.
  pub async fn update_project(
    &self,
    id: u64,
    changes: &ProjectChanges,
    version: Option<u64>,
  ) -> Result<Project, ApiError> {
    let fields = match serde_json::to_value(changes)? {
      Value::Object(fields) => fields,
      _ => Map::new(),
    };
    let mut request = ApiRequest::patch(format!("projects/{id}/"), Value::Object(fields.clone()));
    if let Some(version) = version {
      request = request.with_header("If-Match", format!("W/\"{version}\""));
    }

    let mutation = Mutation::new("update_project", [Tag::project(id), Tag::project_list()])
      .with_patch(move |_, data| {
        edit_projects(data, |pid| pid == id, |project| merge_fields(project, &fields))
      })
      .with_primary(QueryKey::new(PROJECT, &id))
      .expecting_version(version);
    let outcome = self.executor.run(mutation, self.remote(request)).await?;
    decode(&outcome.response)
  }

  /// Soft delete. The project disappears from cached lists right away.
  pub async fn delete_project(&self, id: u64) -> Result<(), ApiError> {
    let request = ApiRequest::delete(format!("projects/{id}/"));
    let mutation = Mutation::new(
      "delete_project",
      [Tag::project(id), Tag::project_list(), Tag::project_deleted_list()],
    )
    .with_patch(move |key, data| key.endpoint() == PROJECTS && remove_from_page(data, id));
    self.executor.run(mutation, self.remote(request)).await?;
    Ok(())
  }

  pub async fn bulk_update(&self, update: &BulkUpdate) -> Result<BulkResult, ApiError> {
    let request = ApiRequest::post("projects/bulk-update/", serde_json::to_value(update)?);

    let ids: BTreeSet<u64> = update.ids.iter().copied().collect();
    let mut fields = Map::new();
    for (name, value) in [
      ("status", &update.status),
      ("owner", &update.owner),
      ("health", &update.health),
    ] {
      if let Some(value) = value {
        fields.insert(name.to_string(), Value::from(value.as_str()));
      }
    }
    let tag = update.tag.clone();

    let affected = ids
      .iter()
      .map(|id| Tag::project(*id))
      .chain([Tag::project_list()]);
    let mutation = Mutation::new("bulk_update", affected).with_patch(move |_, data| {
      edit_projects(
        data,
        |pid| ids.contains(&pid),
        |project| {
          let mut changed = merge_fields(project, &fields);
          if let Some(tag) = &tag {
            changed |= add_tag(project, tag);
          }
          changed
        },
      )
    });
    let outcome = self.executor.run(mutation, self.remote(request)).await?;
    decode(&outcome.response)
  }

  /// Restore a soft-deleted project.
  pub async fn recover_project(&self, id: u64) -> Result<Project, ApiError> {
    let request = ApiRequest::post(format!("projects/{id}/recover/"), json!({}));
    let mutation = Mutation::new(
      "recover_project",
      [Tag::project(id), Tag::project_list(), Tag::project_deleted_list()],
    )
    .with_patch(move |key, data| key.endpoint() == DELETED_PROJECTS && remove_from_page(data, id))
    .with_primary(QueryKey::new(PROJECT, &id));
    let outcome = self.executor.run(mutation, self.remote(request)).await?;
    decode(&outcome.response)
  }

  pub async fn bulk_recover(&self, ids: &[u64]) -> Result<BulkResult, ApiError> {
    let request = ApiRequest::post("projects/bulk-recover/", json!({ "ids": ids }));
    let recovered: BTreeSet<u64> = ids.iter().copied().collect();
    let affected = recovered
      .iter()
      .map(|id| Tag::project(*id))
      .chain([Tag::project_list(), Tag::project_deleted_list()]);
    let mutation = Mutation::new("bulk_recover", affected).with_patch(move |key, data| {
      if key.endpoint() != DELETED_PROJECTS {
        return false;
      }
      // Non-short-circuiting so every recovered id is removed.
      recovered
        .iter()
        .fold(false, |changed, id| remove_from_page(data, *id) | changed)
    });
    let outcome = self.executor.run(mutation, self.remote(request)).await?;
    decode(&outcome.response)
  }

  fn remote(&self, request: ApiRequest) -> impl Future<Output = Result<Value, ApiError>> {
    let response = self.transport.send(request);
    async move { response.await?.into_result() }
  }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, ApiError> {
  <T as Deserialize>::deserialize(value).map_err(ApiError::from)
}

fn check_shape<T: DeserializeOwned>(value: &Value) -> Result<(), ApiError> {
  decode::<T>(value).map(drop)
}

fn result_ids(data: &Value) -> impl Iterator<Item = u64> + '_ {
  data
    .get("results")
    .and_then(Value::as_array)
    .into_iter()
    .flatten()
    .filter_map(|item| item.get("id").and_then(Value::as_u64))
}

fn provides_list(data: &Value) -> Vec<Tag> {
  result_ids(data)
    .map(Tag::project)
    .chain([Tag::project_list()])
    .collect()
}

fn provides_deleted(data: &Value) -> Vec<Tag> {
  result_ids(data)
    .map(Tag::project)
    .chain([Tag::project_deleted_list()])
    .collect()
}

fn provides_detail(data: &Value) -> Vec<Tag> {
  data
    .get("id")
    .and_then(Value::as_u64)
    .map(Tag::project)
    .into_iter()
    .collect()
}

fn provides_choices(_: &Value) -> Vec<Tag> {
  vec![Tag::project_list()]
}
