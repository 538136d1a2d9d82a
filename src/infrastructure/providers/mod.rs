mod chat_backend;
mod descriptor;
mod registry;
mod speech_backend;

pub use chat_backend::ChatBackend;
pub use descriptor::{
    ApiKeyRequirement, BackendFamily, Capability, ContextWindow, CostPer1MTokens, ModelSpec,
    ProviderDescriptor, ProviderType,
};
pub use registry::{ProviderRegistry, RegistryError};
pub use speech_backend::SpeechBackend;
