//! Tag → query key back-reference index.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::key::{QueryKey, Tag};

/// Maps each tag to the set of cached keys that declared it.
///
/// Holds no entry data. It is owned by the cache state and updated in the
/// same critical section as every entry write or eviction.
#[derive(Debug, Default)]
pub struct TagIndex {
  by_tag: HashMap<Tag, HashSet<QueryKey>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keys currently depending on `tag`.
  pub fn keys(&self, tag: &Tag) -> BTreeSet<QueryKey> {
    self
      .by_tag
      .get(tag)
      .map(|keys| keys.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Move `key` from its old tag set to its new one.
  ///
  /// Touches only the buckets named in `old` and `new`.
  pub fn reindex(&mut self, key: &QueryKey, old: &BTreeSet<Tag>, new: &BTreeSet<Tag>) {
    for tag in old.difference(new) {
      self.detach(key, tag);
    }
    for tag in new.difference(old) {
      self.by_tag.entry(*tag).or_default().insert(key.clone());
    }
  }

  /// Drop every association of `key` (used on eviction).
  pub fn remove(&mut self, key: &QueryKey, tags: &BTreeSet<Tag>) {
    for tag in tags {
      self.detach(key, tag);
    }
  }

  /// Deduplicated union of the keys for all `tags`.
  pub fn invalidate<'a, I>(&self, tags: I) -> BTreeSet<QueryKey>
  where
    I: IntoIterator<Item = &'a Tag>,
  {
    let mut affected = BTreeSet::new();
    for tag in tags {
      if let Some(keys) = self.by_tag.get(tag) {
        affected.extend(keys.iter().cloned());
      }
    }
    affected
  }

  pub fn clear(&mut self) {
    self.by_tag.clear();
  }

  /// Number of tags with at least one dependent key.
  pub fn tag_count(&self) -> usize {
    self.by_tag.len()
  }

  fn detach(&mut self, key: &QueryKey, tag: &Tag) {
    if let Some(keys) = self.by_tag.get_mut(tag) {
      keys.remove(key);
      if keys.is_empty() {
        self.by_tag.remove(tag);
      }
    }
  }

  /// Rebuild from scratch. Only used to check the incremental index.
  #[cfg(test)]
  pub fn rebuild_from<'a, I>(entries: I) -> Self
  where
    I: IntoIterator<Item = (&'a QueryKey, &'a BTreeSet<Tag>)>,
  {
    let mut index = Self::new();
    for (key, tags) in entries {
      index.reindex(key, &BTreeSet::new(), tags);
    }
    index
  }

  #[cfg(test)]
  pub fn same_as(&self, other: &TagIndex) -> bool {
    self.by_tag == other.by_tag
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tags(list: &[Tag]) -> BTreeSet<Tag> {
    list.iter().copied().collect()
  }

  #[test]
  fn test_reindex_moves_associations() {
    let mut index = TagIndex::new();
    let key = QueryKey::bare("projects");

    index.reindex(&key, &BTreeSet::new(), &tags(&[Tag::project_list(), Tag::project(1)]));
    assert!(index.keys(&Tag::project(1)).contains(&key));

    index.reindex(
      &key,
      &tags(&[Tag::project_list(), Tag::project(1)]),
      &tags(&[Tag::project_list(), Tag::project(2)]),
    );
    assert!(index.keys(&Tag::project(1)).is_empty());
    assert!(index.keys(&Tag::project(2)).contains(&key));
    assert_eq!(index.tag_count(), 2);
  }

  #[test]
  fn test_invalidate_dedupes_union() {
    let mut index = TagIndex::new();
    let list = QueryKey::bare("projects");
    let detail = QueryKey::new("project", &7u64);
    index.reindex(&list, &BTreeSet::new(), &tags(&[Tag::project_list(), Tag::project(7)]));
    index.reindex(&detail, &BTreeSet::new(), &tags(&[Tag::project(7)]));

    let affected = index.invalidate(&[Tag::project(7), Tag::project_list()]);
    assert_eq!(affected.len(), 2);
    assert!(index.invalidate(&[Tag::project_deleted_list()]).is_empty());
  }

  #[test]
  fn test_remove_drops_empty_buckets() {
    let mut index = TagIndex::new();
    let key = QueryKey::bare("projects");
    let set = tags(&[Tag::project_list(), Tag::project(3)]);
    index.reindex(&key, &BTreeSet::new(), &set);
    index.remove(&key, &set);
    assert_eq!(index.tag_count(), 0);
  }
}
