//! Optimistic patches over cached project data.
//!
//! Cached data is either a single project object or a page
//! (`{count, limit, offset, results: [...]}`). Every helper returns whether it
//! changed anything, so untouched entries are not recorded for rollback.

use serde_json::{Map, Value};

/// Remove project `id` from a cached page, decrementing its count.
///
/// The count never goes below zero, and nothing changes if the project is
/// not on the page.
pub fn remove_from_page(data: &mut Value, id: u64) -> bool {
  let Some(results) = data.get_mut("results").and_then(Value::as_array_mut) else {
    return false;
  };
  let before = results.len();
  results.retain(|item| item_id(item) != Some(id));
  if results.len() == before {
    return false;
  }

  if let Some(count) = data.get("count").and_then(Value::as_u64) {
    data["count"] = Value::from(count.saturating_sub(1));
  }
  true
}

/// Apply `edit` to every project in `data` whose id satisfies `matches`.
///
/// Works on both pages and single-project entries.
pub fn edit_projects<M, E>(data: &mut Value, matches: M, mut edit: E) -> bool
where
  M: Fn(u64) -> bool,
  E: FnMut(&mut Map<String, Value>) -> bool,
{
  let mut changed = false;
  if let Some(results) = data.get_mut("results").and_then(Value::as_array_mut) {
    for item in results.iter_mut() {
      if item_id(item).is_some_and(&matches) {
        if let Some(obj) = item.as_object_mut() {
          changed |= edit(obj);
        }
      }
    }
    return changed;
  }

  if item_id(data).is_some_and(&matches) {
    if let Some(obj) = data.as_object_mut() {
      changed = edit(obj);
    }
  }
  changed
}

/// Overwrite the given fields, reporting whether any value differed.
pub fn merge_fields(target: &mut Map<String, Value>, fields: &Map<String, Value>) -> bool {
  let mut changed = false;
  for (name, value) in fields {
    if target.get(name) != Some(value) {
      target.insert(name.clone(), value.clone());
      changed = true;
    }
  }
  changed
}

/// Append `tag` to the project's tag list unless already present.
pub fn add_tag(target: &mut Map<String, Value>, tag: &str) -> bool {
  let tags = target
    .entry("tags")
    .or_insert_with(|| Value::Array(Vec::new()));
  let Some(list) = tags.as_array_mut() else {
    return false;
  };
  if list.iter().any(|t| t.as_str() == Some(tag)) {
    return false;
  }
  list.push(Value::from(tag));
  true
}

fn item_id(item: &Value) -> Option<u64> {
  item.get("id").and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn page(ids: &[u64], count: u64) -> Value {
    json!({
      "count": count,
      "results": ids.iter().map(|id| json!({"id": id, "status": "active", "tags": []})).collect::<Vec<_>>(),
    })
  }

  #[test]
  fn test_remove_present_item_decrements_count() {
    let mut data = page(&[1, 2, 3], 3);
    assert!(remove_from_page(&mut data, 2));
    assert_eq!(data, page(&[1, 3], 2));
  }

  #[test]
  fn test_remove_absent_item_is_noop() {
    let mut data = page(&[1, 3], 12);
    assert!(!remove_from_page(&mut data, 2));
    assert_eq!(data["count"], json!(12));
  }

  #[test]
  fn test_count_never_negative() {
    let mut data = page(&[4], 0);
    assert!(remove_from_page(&mut data, 4));
    assert_eq!(data["count"], json!(0));
  }

  #[test]
  fn test_edit_projects_on_page_and_detail() {
    let mut fields = Map::new();
    fields.insert("status".into(), json!("paused"));

    let mut list = page(&[1, 2], 2);
    assert!(edit_projects(&mut list, |id| id == 2, |p| merge_fields(p, &fields)));
    assert_eq!(list["results"][0]["status"], json!("active"));
    assert_eq!(list["results"][1]["status"], json!("paused"));
    assert!(!edit_projects(&mut list, |id| id == 2, |p| merge_fields(p, &fields)));

    let mut detail = json!({"id": 9, "status": "active"});
    assert!(!edit_projects(&mut detail, |id| id == 2, |p| merge_fields(p, &fields)));
    assert!(edit_projects(&mut detail, |id| id == 9, |p| merge_fields(p, &fields)));
  }

  #[test]
  fn test_add_tag_once() {
    let mut project = Map::new();
    assert!(add_tag(&mut project, "infra"));
    assert!(!add_tag(&mut project, "infra"));
    assert_eq!(project["tags"], json!(["infra"]));
  }
}
