//! Versioned name -> handler registries for orchestrations and activities.
//!
//! Both kinds share `Registry<H>`. Activities are always stored at 1.0.0 and
//! resolved by name; orchestrations can carry several semver versions and a
//! per-name [`VersionPolicy`] that picks the version for new instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use semver::Version;

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::OrchestrationContext;

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

type VersionMap<H> = HashMap<String, BTreeMap<Version, Arc<H>>>;

pub struct Registry<H: ?Sized> {
    inner: Arc<VersionMap<H>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: VersionMap<H>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<String, VersionPolicy>> {
        self.policy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve the handler new instances of `name` should use.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self.policies().get(name).cloned().unwrap_or(VersionPolicy::Latest);
        let versions = self.inner.get(name);
        let result = match &pol {
            VersionPolicy::Latest => versions
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions
                .and_then(|m| m.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }
        result
    }

    /// Resolve the handler a pinned instance must be replayed with.
    pub fn resolve_handler_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|m| m.get(version)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(version), None);
        }
        result
    }

    /// Activity lookup by name.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner
            .get(name)
            .and_then(|m| m.iter().next_back())
            .map(|(_, h)| Arc::clone(h))
    }

    /// Change which version new instances pick up, e.g. to roll back.
    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policies().insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "duroflow::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions_for_name = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        if !self.errors.is_empty() {
            tracing::warn!(
                target: "duroflow::runtime::registry",
                errors = ?self.errors,
                "registry built with registration errors; offending entries were skipped"
            );
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, failing on duplicate or malformed registrations.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, what: &str) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!("duplicate {what} registration: {name}@{version}"));
            return;
        }
        entry.insert(version, handler);
    }

    fn parse_version(&mut self, name: &str, version: &str) -> Option<Version> {
        match Version::parse(version) {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(format!("invalid version for {name}: {version} ({e})"));
                None
            }
        }
    }
}

type BoxedTurn = std::pin::Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

fn typed_orchestration<In, Out, F, Fut>(f: F) -> impl Fn(OrchestrationContext, String) -> BoxedTurn + Send + Sync + 'static
where
    In: serde::de::DeserializeOwned + Send + 'static,
    Out: serde::Serialize + Send + 'static,
    F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, String>> + Send + 'static,
{
    let f = Arc::new(f);
    move |ctx: OrchestrationContext, raw: String| -> BoxedTurn {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let input: In = Json::decode(&raw)?;
            let out: Out = f(ctx, input).await?;
            Json::encode(&out)
        })
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = typed_orchestration(f);
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    /// Register an additional version. Versions must be registered in
    /// increasing order per name.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let Some(v) = self.parse_version(&name, version.as_ref()) else {
            return self;
        };
        if let Some((latest, _)) = self.map.get(&name).and_then(|m| m.iter().next_back())
            && &v <= latest
        {
            self.errors.push(format!(
                "non-monotonic orchestration version for {name}: {v} is not later than {latest}"
            ));
            return self;
        }
        self.insert(name, v, Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register_versioned(name, version, typed_orchestration(f))
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(crate::ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: crate::ActivityContext, raw: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&raw)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(wrapper)), "activity");
        self
    }
}
