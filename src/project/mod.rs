use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{HelmError, HelmResult};
use crate::persistence::PersistenceStore;

const CATALOG_FILE: &str = "projects.json";

/// A registered project directory. Identity is `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub path: String,
    pub name: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl Project {
    pub fn new(path: &str, name: Option<String>) -> Self {
        let name = name.unwrap_or_else(|| {
            Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string())
        });
        Self {
            path: path.to_string(),
            name,
            registered_at: Utc::now(),
            version: default_version(),
        }
    }
}

/// Opaque URL-safe token for a project path (reversible base64url over
/// the path bytes). The server decodes before use.
pub fn encode_path_token(path: &str) -> String {
    URL_SAFE_NO_PAD.encode(path.as_bytes())
}

pub fn decode_path_token(token: &str) -> HelmResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|_| HelmError::validation("malformed project path token"))?;
    String::from_utf8(bytes).map_err(|_| HelmError::validation("project path token is not UTF-8"))
}

/// Persisted catalog of registered projects.
///
/// Unregistering removes the catalog entry only; neither the working tree
/// nor any persisted session state is touched.
pub struct ProjectRegistry {
    store: Arc<PersistenceStore>,
    projects: RwLock<HashMap<String, Project>>,
}

impl ProjectRegistry {
    pub async fn load(store: Arc<PersistenceStore>) -> HelmResult<Self> {
        let catalog: Vec<Project> = store
            .read_catalog(CATALOG_FILE)
            .await?
            .unwrap_or_default();
        let projects = catalog
            .into_iter()
            .map(|p| (p.path.clone(), p))
            .collect();
        Ok(Self {
            store,
            projects: RwLock::new(projects),
        })
    }

    pub async fn register(&self, path: &str, name: Option<String>) -> HelmResult<Project> {
        if path.trim().is_empty() {
            return Err(HelmError::validation("project path cannot be empty"));
        }
        if !Path::new(path).is_absolute() {
            return Err(HelmError::validation("project path must be absolute"));
        }

        let mut projects = self.projects.write().await;
        if projects.contains_key(path) {
            return Err(HelmError::AlreadyExists(format!("project '{}'", path)));
        }

        let project = Project::new(path, name);
        projects.insert(path.to_string(), project.clone());
        self.persist(&projects).await?;
        tracing::info!(path, "registered project");
        Ok(project)
    }

    pub async fn unregister(&self, path: &str) -> HelmResult<()> {
        let mut projects = self.projects.write().await;
        if projects.remove(path).is_none() {
            return Err(HelmError::not_found(format!("project '{}'", path)));
        }
        self.persist(&projects).await?;
        tracing::info!(path, "unregistered project");
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Option<Project> {
        self.projects.read().await.get(path).cloned()
    }

    pub async fn require(&self, path: &str) -> HelmResult<Project> {
        self.get(path)
            .await
            .ok_or_else(|| HelmError::not_found(format!("project '{}'", path)))
    }

    pub async fn list(&self) -> Vec<Project> {
        let mut all: Vec<Project> = self.projects.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        all
    }

    /// Re-adds a project found on disk during recovery that is missing
    /// from the catalog (the catalog write may have been lost in a crash).
    pub async fn adopt(&self, project: Project) -> HelmResult<()> {
        let mut projects = self.projects.write().await;
        if projects.contains_key(&project.path) {
            return Ok(());
        }
        projects.insert(project.path.clone(), project);
        self.persist(&projects).await
    }

    async fn persist(&self, projects: &HashMap<String, Project>) -> HelmResult<()> {
        let mut catalog: Vec<&Project> = projects.values().collect();
        catalog.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        self.store.write_catalog(CATALOG_FILE, &catalog).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_token_round_trip() {
        let path = "/tmp/my project/src";
        let token = encode_path_token(path);
        assert!(!token.contains('/'));
        assert!(!token.contains('+'));
        assert_eq!(decode_path_token(&token).unwrap(), path);
    }

    #[test]
    fn test_bad_token_is_validation_error() {
        assert!(matches!(
            decode_path_token("not!!base64"),
            Err(HelmError::Validation(_))
        ));
    }

    #[test]
    fn test_project_name_defaults_to_dirname() {
        let project = Project::new("/tmp/p1", None);
        assert_eq!(project.name, "p1");

        let project = Project::new("/tmp/p1", Some("custom".into()));
        assert_eq!(project.name, "custom");
    }

    #[tokio::test]
    async fn test_register_list_unregister() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PersistenceStore::new(dir.path()).unwrap());
        let registry = ProjectRegistry::load(store.clone()).await.unwrap();

        registry.register("/tmp/p1", None).await.unwrap();
        assert!(matches!(
            registry.register("/tmp/p1", None).await,
            Err(HelmError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.register("relative", None).await,
            Err(HelmError::Validation(_))
        ));

        assert_eq!(registry.list().await.len(), 1);

        // Catalog survives a reload.
        let reloaded = ProjectRegistry::load(store).await.unwrap();
        assert!(reloaded.get("/tmp/p1").await.is_some());

        reloaded.unregister("/tmp/p1").await.unwrap();
        assert!(matches!(
            reloaded.unregister("/tmp/p1").await,
            Err(HelmError::NotFound(_))
        ));
    }
}
