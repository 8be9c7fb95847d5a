//! The in-memory table set.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use mcpr_approval::ApprovalRequest;
use mcpr_audit::{AuditEvent, AuditFilter, AuditSink};
use mcpr_auth::{Token, TokenLookup};
use mcpr_core::{
    ApprovalId, ClientId, PolicyRuleId, Project, ProjectId, ServerDescriptor, ServerId,
    ServerStatus, TokenId, Timestamp,
};
use mcpr_policy::PolicyRule;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::{StorageError, StorageResult};
use crate::memory::{MemoryEntry, MemoryPage};

/// Every table the gateway persists.
#[derive(Debug, Default)]
pub struct Tables {
    /// Server descriptors by id.
    pub servers: HashMap<ServerId, ServerDescriptor>,
    /// Tokens by id.
    pub tokens: HashMap<TokenId, Token>,
    /// Projects by id.
    pub projects: HashMap<ProjectId, Project>,
    /// Policy rules by id.
    pub policies: HashMap<PolicyRuleId, PolicyRule>,
    /// Approval history by id.
    pub approvals: HashMap<ApprovalId, ApprovalRequest>,
    /// Append-only audit log.
    pub audit: Vec<AuditEvent>,
    /// Built-in memory entries, ordered for stable pagination.
    pub memories: BTreeMap<(ClientId, String), MemoryEntry>,
}

/// The single-host store. Every method is atomic; multi-row writes go
/// through [`MemoryStore::transaction`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure over the whole table set under one write lock.
    ///
    /// An `Err` from the closure aborts with no partial effects *only if*
    /// the closure itself avoids mutating before failing; the convention
    /// here is validate-then-write.
    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> StorageResult<T> + Send,
    ) -> StorageResult<T> {
        let mut tables = self.tables.write().await;
        f(&mut tables)
    }

    // -----------------------------------------------------------------------
    // Servers
    // -----------------------------------------------------------------------

    /// Insert or replace a server descriptor.
    pub async fn upsert_server(&self, server: ServerDescriptor) {
        self.tables
            .write()
            .await
            .servers
            .insert(server.id.clone(), server);
    }

    /// Fetch a server by id.
    pub async fn server(&self, id: &ServerId) -> Option<ServerDescriptor> {
        self.tables.read().await.servers.get(id).cloned()
    }

    /// All server descriptors.
    pub async fn servers(&self) -> Vec<ServerDescriptor> {
        self.tables.read().await.servers.values().cloned().collect()
    }

    /// Update a server's status (and clear or set its last error).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown servers.
    pub async fn set_server_status(
        &self,
        id: &ServerId,
        status: ServerStatus,
        error: Option<String>,
    ) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let server = tables
            .servers
            .get_mut(id)
            .ok_or(StorageError::NotFound { entity: "server" })?;
        match error {
            Some(message) => server.set_error(message),
            None => server.set_status(status),
        }
        Ok(())
    }

    /// Remove a server descriptor.
    pub async fn remove_server(&self, id: &ServerId) -> Option<ServerDescriptor> {
        self.tables.write().await.servers.remove(id)
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    /// Insert a token.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] when the id already exists.
    pub async fn insert_token(&self, token: Token) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if tables.tokens.contains_key(&token.id) {
            return Err(StorageError::Conflict {
                reason: "token id already exists".to_string(),
            });
        }
        tables.tokens.insert(token.id.clone(), token);
        Ok(())
    }

    /// Revoke a token.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown tokens.
    pub async fn revoke_token(&self, id: &TokenId) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let token = tables
            .tokens
            .get_mut(id)
            .ok_or(StorageError::NotFound { entity: "token" })?;
        token.revoke();
        Ok(())
    }

    /// All tokens.
    pub async fn tokens(&self) -> Vec<Token> {
        self.tables.read().await.tokens.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Insert or replace a project.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] when another project owns the slug.
    pub async fn upsert_project(&self, project: Project) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let slug_taken = tables
            .projects
            .values()
            .any(|p| p.slug == project.slug && p.id != project.id);
        if slug_taken {
            return Err(StorageError::Conflict {
                reason: format!("project slug '{}' already exists", project.slug),
            });
        }
        tables.projects.insert(project.id.clone(), project);
        Ok(())
    }

    /// Resolve a project by id or slug, the way the project header does.
    pub async fn find_project(&self, id_or_slug: &str) -> Option<Project> {
        let tables = self.tables.read().await;
        if let Some(id) = ProjectId::parse(id_or_slug) {
            if let Some(project) = tables.projects.get(&id) {
                return Some(project.clone());
            }
        }
        tables
            .projects
            .values()
            .find(|p| p.slug == id_or_slug)
            .cloned()
    }

    /// All projects.
    pub async fn projects(&self) -> Vec<Project> {
        self.tables.read().await.projects.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------------

    /// Insert or replace a rule.
    pub async fn upsert_policy(&self, rule: PolicyRule) {
        self.tables
            .write()
            .await
            .policies
            .insert(rule.id.clone(), rule);
    }

    /// Remove a rule.
    pub async fn remove_policy(&self, id: &PolicyRuleId) -> Option<PolicyRule> {
        self.tables.write().await.policies.remove(id)
    }

    /// All enabled rules; what the evaluator consumes.
    pub async fn enabled_policies(&self) -> Vec<PolicyRule> {
        self.tables
            .read()
            .await
            .policies
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    /// Every rule, enabled or not.
    pub async fn policies(&self) -> Vec<PolicyRule> {
        self.tables.read().await.policies.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Insert or update an approval record (open and resolution both land
    /// here).
    pub async fn record_approval(&self, approval: ApprovalRequest) {
        self.tables
            .write()
            .await
            .approvals
            .insert(approval.id.clone(), approval);
    }

    /// Fetch an approval record.
    pub async fn approval(&self, id: &ApprovalId) -> Option<ApprovalRequest> {
        self.tables.read().await.approvals.get(id).cloned()
    }

    /// All approval records.
    pub async fn approvals(&self) -> Vec<ApprovalRequest> {
        self.tables
            .read()
            .await
            .approvals
            .values()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Memory entries
    // -----------------------------------------------------------------------

    /// Store a memory entry, overwriting the key for this client.
    pub async fn memory_put(&self, client_id: ClientId, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut tables = self.tables.write().await;
        let now = Timestamp::now();
        tables
            .memories
            .entry((client_id.clone(), key.clone()))
            .and_modify(|entry| {
                entry.value = value.clone();
                entry.updated_at = now;
            })
            .or_insert_with(|| MemoryEntry {
                client_id,
                key,
                value,
                created_at: now,
                updated_at: now,
            });
    }

    /// Fetch one memory entry.
    pub async fn memory_get(&self, client_id: &ClientId, key: &str) -> Option<MemoryEntry> {
        self.tables
            .read()
            .await
            .memories
            .get(&(client_id.clone(), key.to_string()))
            .cloned()
    }

    /// List a client's memory entries, one page at a time.
    pub async fn memory_list(
        &self,
        client_id: &ClientId,
        offset: usize,
        limit: usize,
    ) -> MemoryPage {
        let tables = self.tables.read().await;
        let all: Vec<&MemoryEntry> = tables
            .memories
            .range((client_id.clone(), String::new())..)
            .take_while(|((c, _), _)| c == client_id)
            .map(|(_, entry)| entry)
            .collect();

        let entries: Vec<MemoryEntry> =
            all.iter().skip(offset).take(limit).map(|e| (*e).clone()).collect();
        let consumed = offset + entries.len();
        let next_offset = (consumed < all.len()).then_some(consumed);
        MemoryPage {
            entries,
            next_offset,
        }
    }
}

#[async_trait]
impl TokenLookup for MemoryStore {
    async fn token(&self, id: &TokenId) -> Option<Token> {
        self.tables.read().await.tokens.get(id).cloned()
    }

    async fn touch_token(&self, id: &TokenId, at: Timestamp) {
        if let Some(token) = self.tables.write().await.tokens.get_mut(id) {
            token.last_used_at = Some(at);
        }
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, event: AuditEvent) {
        trace!(event = %event.event_type, "audit append");
        self.tables.write().await.audit.push(event);
    }

    async fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let tables = self.tables.read().await;
        let mut matched: Vec<AuditEvent> = tables
            .audit
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.reverse();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpr_core::TransportKind;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn descriptor(name: &str) -> ServerDescriptor {
        ServerDescriptor::new(
            name,
            TransportKind::Stdio {
                command: "server".to_string(),
                args: vec![],
                env: StdHashMap::new(),
                cwd: None,
            },
        )
    }

    #[tokio::test]
    async fn test_server_roundtrip() {
        let store = MemoryStore::new();
        let server = descriptor("Filesystem");
        let id = server.id.clone();

        store.upsert_server(server).await;
        assert_eq!(store.server(&id).await.unwrap().name, "Filesystem");

        store
            .set_server_status(&id, ServerStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(store.server(&id).await.unwrap().status, ServerStatus::Running);

        store
            .set_server_status(&id, ServerStatus::Error, Some("spawn failed".to_string()))
            .await
            .unwrap();
        let stored = store.server(&id).await.unwrap();
        assert_eq!(stored.status, ServerStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("spawn failed"));
    }

    #[tokio::test]
    async fn test_token_conflict() {
        let store = MemoryStore::new();
        let token = Token::issue(ClientId::from("c1"), "t", None);
        store.insert_token(token.clone()).await.unwrap();
        let err = store.insert_token(token).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_project_slug_lookup_and_conflict() {
        let store = MemoryStore::new();
        let project = Project::new("My Project");
        let id = project.id.clone();
        store.upsert_project(project).await.unwrap();

        assert_eq!(
            store.find_project("my-project").await.unwrap().id,
            id.clone()
        );
        assert_eq!(store.find_project(&id.to_string()).await.unwrap().id, id);
        assert!(store.find_project("nope").await.is_none());

        let mut clash = Project::new("Different");
        clash.slug = "my-project".to_string();
        assert!(store.upsert_project(clash).await.is_err());
    }

    #[tokio::test]
    async fn test_enabled_policies_filter() {
        use mcpr_policy::{PolicyAction, ResourceType};
        let store = MemoryStore::new();
        store
            .upsert_policy(PolicyRule::global(
                "on",
                ResourceType::Tool,
                "*",
                PolicyAction::Allow,
                1,
            ))
            .await;
        store
            .upsert_policy(
                PolicyRule::global("off", ResourceType::Tool, "*", PolicyAction::Deny, 2)
                    .disabled(),
            )
            .await;

        assert_eq!(store.enabled_policies().await.len(), 1);
        assert_eq!(store.policies().await.len(), 2);
    }

    #[tokio::test]
    async fn test_transaction_spanning_rows() {
        let store = MemoryStore::new();
        let server = descriptor("Filesystem");
        let server_id = server.id.clone();

        // Register a server and grant a token access in one transaction.
        let token = Token::issue(ClientId::from("c1"), "t", None)
            .with_server_access(server_id.clone());
        let token_id = token.id.clone();
        store
            .transaction(|tables| {
                tables.servers.insert(server_id.clone(), server);
                tables.tokens.insert(token_id.clone(), token);
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.server(&server_id).await.is_some());
        assert!(store.token(&token_id).await.is_some());
    }

    #[tokio::test]
    async fn test_memory_pagination() {
        let store = MemoryStore::new();
        let c1 = ClientId::from("c1");
        for i in 0..5 {
            store.memory_put(c1.clone(), format!("k{i}"), json!(i)).await;
        }
        // Another client's entries must not leak into the listing.
        store
            .memory_put(ClientId::from("c2"), "other", json!(true))
            .await;

        let first = store.memory_list(&c1, 0, 2).await;
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_offset, Some(2));

        let second = store.memory_list(&c1, 2, 2).await;
        assert_eq!(second.entries.len(), 2);
        assert_eq!(second.next_offset, Some(4));

        let last = store.memory_list(&c1, 4, 2).await;
        assert_eq!(last.entries.len(), 1);
        assert_eq!(last.next_offset, None);
    }

    #[tokio::test]
    async fn test_memory_overwrite_updates() {
        let store = MemoryStore::new();
        let c1 = ClientId::from("c1");
        store.memory_put(c1.clone(), "k", json!("v1")).await;
        store.memory_put(c1.clone(), "k", json!("v2")).await;

        let entry = store.memory_get(&c1, "k").await.unwrap();
        assert_eq!(entry.value, json!("v2"));
        assert!(entry.updated_at >= entry.created_at);
    }

    #[tokio::test]
    async fn test_audit_sink_impl() {
        use mcpr_audit::AuditEventType;
        let store = MemoryStore::new();
        AuditSink::append(
            &store,
            mcpr_audit::AuditEvent::new(AuditEventType::ToolCall),
        )
        .await;
        let events = AuditSink::query(&store, &AuditFilter::default()).await;
        assert_eq!(events.len(), 1);
    }
}
