//! Document metadata attached to every compiled script and module.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize, serde::Serialize)]
pub enum DocumentKind {
    #[default]
    Script,
    JavaScriptModule,
    CommonJSModule,
    Json,
}

impl DocumentKind {
    pub fn is_module(self) -> bool {
        !matches!(self, DocumentKind::Script)
    }
}

/// Describes where a piece of code came from.
///
/// Cheap to clone; host data is shared.
#[derive(Clone)]
pub struct DocumentInfo {
    pub resource_name: String,
    pub source_map_url: Option<String>,
    pub unique_id: u64,
    pub kind: DocumentKind,
    pub host_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl DocumentInfo {
    /// A document with a freshly allocated unique id.
    pub fn new(resource_name: impl Into<String>, kind: DocumentKind) -> Self {
        Self::with_id(resource_name, kind, Self::next_unique_id())
    }

    pub fn with_id(resource_name: impl Into<String>, kind: DocumentKind, unique_id: u64) -> Self {
        Self {
            resource_name: resource_name.into(),
            source_map_url: None,
            unique_id,
            kind,
            host_data: None,
        }
    }

    pub fn script(resource_name: impl Into<String>) -> Self {
        Self::new(resource_name, DocumentKind::Script)
    }

    pub fn module(resource_name: impl Into<String>) -> Self {
        Self::new(resource_name, DocumentKind::JavaScriptModule)
    }

    pub fn source_map_url(mut self, url: impl Into<String>) -> Self {
        self.source_map_url = Some(url.into());
        self
    }

    pub fn host_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.host_data = Some(data);
        self
    }

    pub fn next_unique_id() -> u64 {
        NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for DocumentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentInfo")
            .field("resource_name", &self.resource_name)
            .field("source_map_url", &self.source_map_url)
            .field("unique_id", &self.unique_id)
            .field("kind", &self.kind)
            .field("host_data", &self.host_data.is_some())
            .finish()
    }
}
