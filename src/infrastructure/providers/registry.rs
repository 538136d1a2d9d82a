use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::application::ports::{RefinementProvider, TranscriptionProvider};

use super::{ApiKeyRequirement, BackendFamily, Capability, ChatBackend, ProviderDescriptor, SpeechBackend};

/// Discovers interchangeable backends from descriptor files and hands out
/// lazily instantiated providers. Layout: `<root>/<name>/defaults.yaml`.
pub struct ProviderRegistry {
    descriptors: BTreeMap<String, ProviderDescriptor>,
    transcription: Mutex<HashMap<String, Arc<dyn TranscriptionProvider>>>,
    refinement: Mutex<HashMap<String, Arc<dyn RefinementProvider>>>,
}

impl ProviderRegistry {
    /// Scan the providers directory. Discovery is deterministic: descriptors
    /// are keyed and iterated by provider name.
    pub fn discover(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        let mut descriptors = BTreeMap::new();

        let entries = std::fs::read_dir(&root).map_err(|e| RegistryError::Io {
            path: root.display().to_string(),
            source: e,
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::Io {
                path: root.display().to_string(),
                source: e,
            })?;
            let descriptor_path = entry.path().join("defaults.yaml");
            if !descriptor_path.is_file() {
                continue;
            }

            let raw = std::fs::read_to_string(&descriptor_path).map_err(|e| RegistryError::Io {
                path: descriptor_path.display().to_string(),
                source: e,
            })?;
            let descriptor: ProviderDescriptor =
                serde_yaml::from_str(&raw).map_err(|e| RegistryError::BadDescriptor {
                    path: descriptor_path.display().to_string(),
                    message: e.to_string(),
                })?;

            tracing::debug!(provider = %descriptor.name, "discovered provider descriptor");
            descriptors.insert(descriptor.name.clone(), descriptor);
        }

        Ok(ProviderRegistry {
            descriptors,
            transcription: Mutex::new(HashMap::new()),
            refinement: Mutex::new(HashMap::new()),
        })
    }

    /// Registry over already-parsed descriptors; test seam.
    pub fn from_descriptors(descriptors: Vec<ProviderDescriptor>) -> Self {
        ProviderRegistry {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            transcription: Mutex::new(HashMap::new()),
            refinement: Mutex::new(HashMap::new()),
        }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.descriptors.values()
    }

    /// Pre-bind an instantiated transcription provider, bypassing the
    /// family-based construction. Used by embedders and tests.
    pub fn register_transcription(
        &self,
        name: &str,
        model: &str,
        provider: Arc<dyn TranscriptionProvider>,
    ) {
        self.transcription
            .lock()
            .expect("registry lock")
            .insert(instance_key(name, model), provider);
    }

    /// Pre-bind an instantiated refinement provider.
    pub fn register_refinement(
        &self,
        name: &str,
        model: &str,
        provider: Arc<dyn RefinementProvider>,
    ) {
        self.refinement
            .lock()
            .expect("registry lock")
            .insert(instance_key(name, model), provider);
    }

    pub fn descriptor(&self, name: &str) -> Result<&ProviderDescriptor, RegistryError> {
        self.descriptors
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    /// Names of providers declaring `capability`, in deterministic order.
    pub fn capable(&self, capability: Capability) -> Vec<String> {
        self.descriptors
            .values()
            .filter(|d| d.has_capability(capability))
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn get_transcription(
        &self,
        name: &str,
        model: &str,
    ) -> Result<Arc<dyn TranscriptionProvider>, RegistryError> {
        let descriptor = self.descriptor(name)?;
        if !descriptor.has_capability(Capability::Transcription) {
            return Err(RegistryError::MissingCapability {
                provider: name.to_string(),
                capability: Capability::Transcription,
            });
        }

        let key = instance_key(name, model);
        let mut instances = self.transcription.lock().expect("registry lock");
        if let Some(existing) = instances.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let api_key = resolve_api_key(descriptor)?;
        let provider: Arc<dyn TranscriptionProvider> = match descriptor.family {
            BackendFamily::Chat => {
                Arc::new(ChatBackend::new(descriptor.clone(), model.to_string(), api_key))
            }
            BackendFamily::Speech => {
                Arc::new(SpeechBackend::new(descriptor.clone(), model.to_string(), api_key))
            }
        };
        instances.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    pub fn get_refinement(
        &self,
        name: &str,
        model: &str,
    ) -> Result<Arc<dyn RefinementProvider>, RegistryError> {
        let descriptor = self.descriptor(name)?;
        if !descriptor.has_capability(Capability::Refinement) {
            return Err(RegistryError::MissingCapability {
                provider: name.to_string(),
                capability: Capability::Refinement,
            });
        }

        let key = instance_key(name, model);
        let mut instances = self.refinement.lock().expect("registry lock");
        if let Some(existing) = instances.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let api_key = resolve_api_key(descriptor)?;
        let provider: Arc<dyn RefinementProvider> = match descriptor.family {
            BackendFamily::Chat => {
                Arc::new(ChatBackend::new(descriptor.clone(), model.to_string(), api_key))
            }
            // Speech backends never declare refinement; the capability check
            // above rejects them first.
            BackendFamily::Speech => {
                return Err(RegistryError::MissingCapability {
                    provider: name.to_string(),
                    capability: Capability::Refinement,
                })
            }
        };
        instances.insert(key, Arc::clone(&provider));
        Ok(provider)
    }
}

fn instance_key(name: &str, model: &str) -> String {
    format!("{}::{}", name, model)
}

/// API keys come from the process environment only, never from persisted
/// configuration.
fn resolve_api_key(descriptor: &ProviderDescriptor) -> Result<Option<String>, RegistryError> {
    let var = descriptor.api_key_env();
    match std::env::var(&var) {
        Ok(key) if !key.is_empty() => Ok(Some(key)),
        _ => match descriptor.api_key_requirement {
            ApiKeyRequirement::Required => Err(RegistryError::MissingApiKey {
                provider: descriptor.name.clone(),
                var,
            }),
            ApiKeyRequirement::Optional | ApiKeyRequirement::None => Ok(None),
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {provider} does not declare the {capability:?} capability")]
    MissingCapability {
        provider: String,
        capability: Capability,
    },
    #[error("provider {provider} requires an API key: set {var}")]
    MissingApiKey { provider: String, var: String },
    #[error("unreadable descriptor at {path}: {message}")]
    BadDescriptor { path: String, message: String },
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
