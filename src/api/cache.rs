//! Local store bindings for API documents.

use crate::cache::{Cacheable, Singleton};

use super::types::{Job, Stats, UserProfile};

impl Cacheable for Job {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn collection() -> &'static str {
    "jobs"
  }
}

impl Cacheable for Stats {
  fn cache_key(&self) -> String {
    Self::KEY.to_string()
  }

  fn collection() -> &'static str {
    "stats"
  }
}

impl Singleton for Stats {
  const KEY: &'static str = "dashboard";
}

impl Cacheable for UserProfile {
  fn cache_key(&self) -> String {
    Self::KEY.to_string()
  }

  fn collection() -> &'static str {
    "user"
  }
}

impl Singleton for UserProfile {
  const KEY: &'static str = "current";
}
