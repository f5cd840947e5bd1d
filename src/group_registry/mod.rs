//! GroupRegistry - device group hierarchy
//!
//! ## Responsibilities
//!
//! - Group storage behind a repository boundary
//! - Cached reads for the hot lookup path
//! - Cycle guard: no write may make the parent relation cyclic

mod repository;
mod service;

pub use repository::{GroupRepository, InMemoryGroupRepository, MySqlGroupRepository};
pub use service::GroupService;
