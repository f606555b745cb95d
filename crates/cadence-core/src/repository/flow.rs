//! Flow definition repository trait.
//!
//! Flow definitions are authored elsewhere and treated as immutable by the
//! interpreter; this is only the import and lookup surface. A re-import keeps
//! the id and bumps `version`, which is how readers notice the replacement.

use cadence_types::error::RepositoryError;
use cadence_types::flow::{FlowDefinition, FlowRecord};
use uuid::Uuid;

/// Repository trait for flow definitions.
pub trait FlowRepository: Send + Sync {
    /// Upsert a flow definition (insert or replace by ID).
    ///
    /// Returns `RepositoryError::Conflict` if another flow already uses the name.
    fn save_flow(
        &self,
        flow: &FlowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_flow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowDefinition>, RepositoryError>> + Send;

    /// Stored `version` of a flow, without loading its definition.
    fn get_flow_version(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<u32>, RepositoryError>> + Send;

    fn get_flow_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<FlowDefinition>, RepositoryError>> + Send;

    /// All stored flows ordered by name.
    fn list_flows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowRecord>, RepositoryError>> + Send;

    /// Delete a flow by ID. Returns `true` if it existed.
    fn delete_flow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
