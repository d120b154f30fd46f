pub mod api_types;
pub mod cache;
pub mod client;
pub mod types;

pub use client::{HttpJobApi, JobApi};
pub use types::{Job, JobId, Stats, UserProfile};
