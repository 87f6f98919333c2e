//! Content tree.
//!
//! A nested map from directory name to the sub-tree of that directory, where
//! each node also records whether the directory itself directly contains at
//! least one image. Only directories that (transitively) contain an image are
//! ever present, so an empty tree means "nothing to show here".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key used for the "has images" marker in the JSON form.
pub const IMAGES_KEY: &str = "/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTree {
    #[serde(default)]
    has_images: bool,
    #[serde(default)]
    dirs: BTreeMap<String, ContentTree>,
}

impl ContentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A leaf directory that directly contains images.
    pub fn with_images() -> Self {
        Self {
            has_images: true,
            dirs: BTreeMap::new(),
        }
    }

    /// True when neither this directory nor anything below it has images.
    pub fn is_empty(&self) -> bool {
        !self.has_images && self.dirs.is_empty()
    }

    /// Whether this directory directly contains images.
    pub fn has_images(&self) -> bool {
        self.has_images
    }

    pub fn set_has_images(&mut self, value: bool) {
        self.has_images = value;
    }

    pub fn get(&self, name: &str) -> Option<&ContentTree> {
        self.dirs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dirs.contains_key(name)
    }

    /// Names of the sub-directories with content, sorted.
    pub fn dir_names(&self) -> impl Iterator<Item = &str> {
        self.dirs.keys().map(String::as_str)
    }

    /// Descend along `components`.
    pub fn subtree<S: AsRef<str>>(&self, components: &[S]) -> Option<&ContentTree> {
        components
            .iter()
            .try_fold(self, |node, name| node.dirs.get(name.as_ref()))
    }

    /// Add a sub-directory. Empty sub-trees are ignored, and an existing entry
    /// is merged with the new one rather than replaced.
    pub fn insert_dir(&mut self, name: impl Into<String>, subtree: ContentTree) {
        if subtree.is_empty() {
            return;
        }
        match self.dirs.entry(name.into()) {
            std::collections::btree_map::Entry::Occupied(mut e) => e.get_mut().merge(subtree),
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(subtree);
            }
        }
    }

    /// Merge `subtree` at the directory reached by `components`, creating the
    /// intermediate nodes. Merging into the root when `components` is empty.
    pub fn insert_at<S: AsRef<str>>(&mut self, components: &[S], subtree: ContentTree) {
        if subtree.is_empty() {
            return;
        }
        let mut node = self;
        for name in components {
            node = node.dirs.entry(name.as_ref().to_string()).or_default();
        }
        node.merge(subtree);
    }

    /// Recursively merge `other` into `self`.
    pub fn merge(&mut self, other: ContentTree) {
        self.has_images |= other.has_images;
        for (name, subtree) in other.dirs {
            self.insert_dir(name, subtree);
        }
    }

    /// Remove a sub-directory entry, e.g. once it was found to be empty.
    pub fn remove(&mut self, name: &str) -> Option<ContentTree> {
        self.dirs.remove(name)
    }

    /// JSON form: `{"/": true, "<name>": {...}}`, with `"/"` only present on
    /// directories that directly contain images.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if self.has_images {
            map.insert(IMAGES_KEY.to_string(), Value::Bool(true));
        }
        for (name, subtree) in &self.dirs {
            map.insert(name.clone(), subtree.to_json());
        }
        Value::Object(map)
    }
}
