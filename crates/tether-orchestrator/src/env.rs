//! Environment variables pushed to the backend at startup

use std::collections::BTreeMap;
use std::sync::Arc;

/// What a computed environment can depend on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvContext {
    /// Backend API base URL
    pub backend_url: String,
    /// Backend HTTP actions base URL
    pub site_url: String,
    /// Address the host's dev server listens on, if known
    pub dev_server_address: Option<String>,
}

type EnvFn = dyn Fn(&EnvContext) -> BTreeMap<String, String> + Send + Sync;

/// Source of the startup environment, evaluated once per injection
#[derive(Clone)]
pub enum EnvSource {
    Static(BTreeMap<String, String>),
    Computed(Arc<EnvFn>),
}

impl EnvSource {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&EnvContext) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        EnvSource::Computed(Arc::new(f))
    }

    pub fn resolve(&self, context: &EnvContext) -> BTreeMap<String, String> {
        match self {
            EnvSource::Static(vars) => vars.clone(),
            EnvSource::Computed(f) => f(context),
        }
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        EnvSource::Static(BTreeMap::new())
    }
}

impl From<BTreeMap<String, String>> for EnvSource {
    fn from(vars: BTreeMap<String, String>) -> Self {
        EnvSource::Static(vars)
    }
}

impl std::fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvSource::Static(vars) => f
                .debug_tuple("Static")
                .field(&vars.keys().collect::<Vec<_>>())
                .finish(),
            EnvSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}
