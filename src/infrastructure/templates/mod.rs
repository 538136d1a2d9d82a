mod registry;

pub use registry::{TemplateDef, TemplateError, TemplateRegistry};
