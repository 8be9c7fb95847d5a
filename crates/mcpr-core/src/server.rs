//! Downstream server descriptors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::id::{ProjectId, ServerId};
use crate::slug::slugify;
use crate::time::Timestamp;

/// How the gateway reaches a downstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transport")]
pub enum TransportKind {
    /// Spawn a child process and speak newline-delimited JSON-RPC on its pipes.
    Stdio {
        /// Command to run. Executed directly, never through a shell.
        command: String,
        /// Arguments for the command.
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables for the child.
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory.
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Request/response JSON-RPC over HTTP POST.
    Http {
        /// Endpoint URL.
        url: String,
        /// Extra headers sent on every request.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Server-sent events for the inbound direction, paired with HTTP POST
    /// for the outbound direction.
    Sse {
        /// SSE endpoint URL.
        url: String,
        /// Extra headers sent on every request.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportKind {
    /// Short name for logs and status output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }

    /// Whether this transport is backed by a supervised child process.
    #[must_use]
    pub fn is_supervised(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle status of a downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Not running, not asked to run.
    Stopped,
    /// Spawn/connect in progress.
    Starting,
    /// Connected and serving.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Last start or run attempt failed.
    Error,
}

impl ServerStatus {
    /// Whether tool calls may be dispatched in this status.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything the gateway knows about one downstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique id.
    pub id: ServerId,
    /// Human-readable name; its slug is the namespace token.
    pub name: String,
    /// Transport configuration.
    pub transport: TransportKind,
    /// Per-tool permission overrides (tool name -> allowed).
    #[serde(default)]
    pub tool_permissions: HashMap<String, bool>,
    /// Current lifecycle status.
    pub status: ServerStatus,
    /// Message of the most recent failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Project this server is assigned to, if scoped.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    /// When the descriptor was created.
    pub created_at: Timestamp,
    /// When the descriptor was last modified.
    pub updated_at: Timestamp,
}

impl ServerDescriptor {
    /// Create a new descriptor in the `Stopped` state.
    #[must_use]
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        let now = Timestamp::now();
        Self {
            id: ServerId::new(),
            name: name.into(),
            transport,
            tool_permissions: HashMap::new(),
            status: ServerStatus::Stopped,
            last_error: None,
            project_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The namespace token derived from this server's name.
    #[must_use]
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Assign this server to a project.
    #[must_use]
    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Whether a specific tool is permitted on this server.
    ///
    /// Tools absent from the permission map are permitted; the map only
    /// records explicit overrides.
    #[must_use]
    pub fn tool_permitted(&self, tool: &str) -> bool {
        self.tool_permissions.get(tool).copied().unwrap_or(true)
    }

    /// Record a status change, touching `updated_at`.
    pub fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
        self.updated_at = Timestamp::now();
        if status != ServerStatus::Error {
            self.last_error = None;
        }
    }

    /// Record a failure, setting status to `Error`.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = ServerStatus::Error;
        self.last_error = Some(message.into());
        self.updated_at = Timestamp::now();
    }
}
