use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A declared provider ability. Capability filtering is a set-membership
/// query on the descriptor, never a type test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Transcription,
    Refinement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Cloud,
    Local,
    Hybrid,
}

/// Which backend implementation serves this descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    /// Multimodal chat completions: JSONL transcription with an end marker,
    /// schema-directed refinement, optional upstream media cache.
    Chat,
    /// Dedicated speech-to-text endpoint returning verbose segments.
    Speech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRequirement {
    Required,
    Optional,
    None,
}

impl Default for ApiKeyRequirement {
    fn default() -> Self {
        ApiKeyRequirement::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostPer1MTokens {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub context_window: ContextWindow,
    pub cost_per_1m_tokens_usd: CostPer1MTokens,
}

/// A provider as declared by its `defaults.yaml` descriptor file. Nothing
/// about providers is hard-coded: the registry discovers these from the
/// providers directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub family: BackendFamily,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub api_key_requirement: ApiKeyRequirement,
    pub base_url: String,
    /// Post-hoc billing endpoint, relative to `base_url`. When present the
    /// backend must query it and report the actual USD cost of each call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_endpoint: Option<String>,
    #[serde(default)]
    pub upstream_cache: bool,
    #[serde(default)]
    pub supported_containers: Vec<String>,
    #[serde(default)]
    pub accepts_uri: bool,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

impl ProviderDescriptor {
    /// Environment variable holding this provider's API key.
    pub fn api_key_env(&self) -> String {
        format!("{}_API_KEY", self.name.to_uppercase())
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Cost computed from the descriptor's pricing table. Used only when no
    /// post-hoc cost endpoint is available.
    pub fn table_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.model(model) {
            Some(spec) => {
                let pricing = spec.cost_per_1m_tokens_usd;
                input_tokens as f64 / 1_000_000.0 * pricing.input
                    + output_tokens as f64 / 1_000_000.0 * pricing.output
            }
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_yaml() -> &'static str {
        r#"
name: aurel
display_name: Aurel
type: cloud
family: chat
capabilities: [transcription, refinement]
api_key_requirement: required
base_url: https://api.aurel.example/v1
cost_endpoint: /generation
upstream_cache: true
supported_containers: [ogg, mp3, wav]
accepts_uri: true
models:
  - name: aurel-swift
    context_window: {input_tokens: 1000000, output_tokens: 65536}
    cost_per_1m_tokens_usd: {input: 0.1, output: 0.4}
"#
    }

    #[test]
    fn descriptor_parses_from_yaml() {
        let descriptor: ProviderDescriptor = serde_yaml::from_str(descriptor_yaml()).unwrap();
        assert_eq!(descriptor.name, "aurel");
        assert_eq!(descriptor.family, BackendFamily::Chat);
        assert!(descriptor.has_capability(Capability::Transcription));
        assert!(descriptor.has_capability(Capability::Refinement));
        assert_eq!(descriptor.api_key_requirement, ApiKeyRequirement::Required);
        assert!(descriptor.upstream_cache);
    }

    #[test]
    fn api_key_env_is_uppercase_provider_name() {
        let descriptor: ProviderDescriptor = serde_yaml::from_str(descriptor_yaml()).unwrap();
        assert_eq!(descriptor.api_key_env(), "AUREL_API_KEY");
    }

    #[test]
    fn table_cost_scales_with_token_counts() {
        let descriptor: ProviderDescriptor = serde_yaml::from_str(descriptor_yaml()).unwrap();
        let cost = descriptor.table_cost("aurel-swift", 1_000_000, 500_000);
        assert!((cost - 0.3).abs() < 1e-9);
        assert_eq!(descriptor.table_cost("unknown-model", 1_000_000, 0), 0.0);
    }
}
