//! Project (tenant scope) model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::id::{ProjectId, ServerId};
use crate::slug::slugify;
use crate::time::Timestamp;

/// An opaque tenant tag restricting which servers a call may touch.
///
/// Resolved from the `X-MCPR-Project` header by id or slug. Requests with
/// no header run in the global scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique id.
    pub id: ProjectId,
    /// Unique slug used in the header.
    pub slug: String,
    /// Human-readable name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Root path on disk, when the project maps to one.
    #[serde(default)]
    pub root_path: Option<PathBuf>,
    /// Servers assigned to this project.
    #[serde(default)]
    pub server_ids: Vec<ServerId>,
    /// Workspaces belonging to this project.
    #[serde(default)]
    pub workspace_ids: Vec<String>,
    /// Inactive projects reject requests with `PROJECT_INACTIVE`.
    pub active: bool,
    /// Free-form settings.
    #[serde(default)]
    pub settings: Option<Value>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl Project {
    /// Create an active project; the slug derives from the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Timestamp::now();
        Self {
            id: ProjectId::new(),
            slug: slugify(&name),
            name,
            description: None,
            root_path: None,
            server_ids: Vec::new(),
            workspace_ids: Vec::new(),
            active: true,
            settings: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Assign a server to this project.
    #[must_use]
    pub fn with_server(mut self, server_id: ServerId) -> Self {
        self.server_ids.push(server_id);
        self
    }

    /// Deactivate the project.
    #[must_use]
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether a server belongs to this project's scope.
    #[must_use]
    pub fn includes_server(&self, server_id: &ServerId) -> bool {
        self.server_ids.contains(server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_derivation() {
        let project = Project::new("My Side Project");
        assert_eq!(project.slug, "my-side-project");
        assert!(project.active);
    }

    #[test]
    fn test_server_scope() {
        let s1 = ServerId::new();
        let project = Project::new("p").with_server(s1.clone());
        assert!(project.includes_server(&s1));
        assert!(!project.includes_server(&ServerId::new()));
    }
}
