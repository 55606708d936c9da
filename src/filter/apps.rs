//! App identity resolution.
//!
//! The [`AppDescriptorFactory`] turns a raw bundle id into a cached
//! [`AppDescriptor`] using the app-id manifest pushed by the companion app.
//! Helper processes (renderers, crash reporters, launcher shims) often
//! show up under identities the manifest doesn't know. When that happens
//! and the flow carries a process token, the factory asks a
//! [`RootAppQuery`] for the application that launched the process and
//! uses the parent's descriptor instead, cached under the child's id too.

use super::error::{FilterError, FilterResult};
use super::model::{AppDescriptor, ProcessToken};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Static app identification data.
///
/// - `apps`: slug -> bundle ids belonging to that app
/// - `display_names`: slug -> human-readable name
/// - `categories`: category -> slugs in that category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdManifest {
    /// Bundle ids by slug.
    #[serde(default)]
    pub apps: HashMap<String, BTreeSet<String>>,
    /// Display names by slug.
    #[serde(default)]
    pub display_names: HashMap<String, String>,
    /// Slugs by category.
    #[serde(default)]
    pub categories: HashMap<String, BTreeSet<String>>,
}

impl AppIdManifest {
    /// Load a manifest from a JSON file.
    pub fn load(path: &Path) -> FilterResult<Self> {
        let contents = fs::read_to_string(path).map_err(|source| FilterError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| FilterError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Slug owning a bundle id.
    pub fn slug_for(&self, bundle_id: &str) -> Option<&str> {
        self.apps
            .iter()
            .find(|(_, ids)| ids.contains(bundle_id))
            .map(|(slug, _)| slug.as_str())
    }

    /// Build a descriptor for a bundle id from manifest data alone.
    pub fn describe(&self, bundle_id: &str) -> AppDescriptor {
        let Some(slug) = self.slug_for(bundle_id) else {
            return AppDescriptor::unidentified(bundle_id);
        };

        let categories = self
            .categories
            .iter()
            .filter(|(_, slugs)| slugs.contains(slug))
            .map(|(category, _)| category.clone())
            .collect();

        AppDescriptor {
            bundle_id: bundle_id.to_string(),
            slug: Some(slug.to_string()),
            display_name: self.display_names.get(slug).cloned(),
            categories,
        }
    }
}

/// The application that ultimately launched a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootApp {
    /// Parent app's bundle id.
    pub bundle_id: String,
    /// Name observed directly from the OS, if any.
    pub display_name: Option<String>,
}

/// Resolves a process token to the app that launched it.
pub trait RootAppQuery: Send + Sync {
    /// The root app for a process, or `None` if it can't be determined.
    fn root_app(&self, token: ProcessToken) -> Option<RootApp>;
}

/// [`RootAppQuery`] backed by `/proc`.
///
/// Walks parent links from the given pid up to the top-most ancestor that
/// is still below the session leader / init, and reports that ancestor's
/// executable name as its bundle id and its `comm` as display name.
pub struct ProcRootAppQuery {
    proc_root: PathBuf,
    max_depth: usize,
}

impl ProcRootAppQuery {
    /// Query the live `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Query a `/proc`-shaped tree at another location (for testing).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
            max_depth: 64,
        }
    }

    fn parent_pid(&self, pid: u32) -> Option<u32> {
        let status = fs::read_to_string(self.proc_root.join(pid.to_string()).join("status")).ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("PPid:"))
            .and_then(|v| v.trim().parse().ok())
    }

    fn describe_pid(&self, pid: u32) -> Option<RootApp> {
        let dir = self.proc_root.join(pid.to_string());
        let comm = fs::read_to_string(dir.join("comm"))
            .ok()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let exe = fs::read_link(dir.join("exe"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));

        let bundle_id = exe.or_else(|| comm.clone())?;
        Some(RootApp {
            bundle_id,
            display_name: comm,
        })
    }
}

impl Default for ProcRootAppQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl RootAppQuery for ProcRootAppQuery {
    fn root_app(&self, token: ProcessToken) -> Option<RootApp> {
        let mut current = token.0;
        for _ in 0..self.max_depth {
            match self.parent_pid(current) {
                Some(parent) if parent > 1 => {
                    // Stop below the session's top-level process.
                    if self.parent_pid(parent).is_none_or(|gp| gp <= 1) {
                        break;
                    }
                    current = parent;
                }
                _ => break,
            }
        }
        if current == token.0 {
            return None;
        }
        self.describe_pid(current)
    }
}

/// Cache of app descriptors keyed by bundle id.
pub struct AppDescriptorFactory {
    manifest: RwLock<AppIdManifest>,
    cache: RwLock<HashMap<String, AppDescriptor>>,
    root_app_query: Option<Arc<dyn RootAppQuery>>,
}

impl AppDescriptorFactory {
    /// Factory over a manifest, without parent-app resolution.
    pub fn new(manifest: AppIdManifest) -> Self {
        Self {
            manifest: RwLock::new(manifest),
            cache: RwLock::new(HashMap::new()),
            root_app_query: None,
        }
    }

    /// Enable parent-app resolution through the given query.
    #[must_use]
    pub fn with_root_app_query(mut self, query: Arc<dyn RootAppQuery>) -> Self {
        self.root_app_query = Some(query);
        self
    }

    /// Replace the manifest. Cached descriptors are discarded.
    pub fn replace_manifest(&self, manifest: AppIdManifest) {
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = manifest;
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
        debug!("App manifest replaced, descriptor cache cleared");
    }

    /// Descriptor for a bundle id, resolving helper processes to their
    /// parent app when the manifest doesn't know them.
    pub fn make(&self, bundle_id: &str, token: Option<ProcessToken>) -> AppDescriptor {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bundle_id)
        {
            return cached.clone();
        }

        let descriptor = self
            .manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .describe(bundle_id);

        if descriptor.slug.is_none()
            && let (Some(token), Some(query)) = (token, &self.root_app_query)
            && let Some(root) = query.root_app(token)
            && root.bundle_id != bundle_id
        {
            let mut parent = self.make(&root.bundle_id, None);
            if parent.display_name.is_none()
                && let Some(name) = root.display_name
            {
                parent = parent.with_display_name(name);
                self.insert(parent.bundle_id.clone(), parent.clone());
            }
            debug!(
                "Resolved {} to parent app {}",
                bundle_id, parent.bundle_id
            );
            self.insert(bundle_id.to_string(), parent.clone());
            return parent;
        }

        self.insert(bundle_id.to_string(), descriptor.clone());
        descriptor
    }

    /// Number of cached descriptors.
    pub fn cached_count(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn insert(&self, bundle_id: String, descriptor: AppDescriptor) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= MAX_CACHED_DESCRIPTORS && !cache.contains_key(&bundle_id) {
            warn!("App descriptor cache full, clearing");
            cache.clear();
        }
        cache.insert(bundle_id, descriptor);
    }
}

impl std::fmt::Debug for AppDescriptorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppDescriptorFactory")
            .field("cached", &self.cached_count())
            .field("root_app_query", &self.root_app_query.is_some())
            .finish_non_exhaustive()
    }
}

const MAX_CACHED_DESCRIPTORS: usize = 4096;
