use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::{ArtifactSpec, FieldSpec, RequiredFields};

/// One template as declared on disk: inert data until a renderer plugin
/// consumes the body. The registry's only contract is lookup and metadata
/// parsing; the refinement stage reads nothing but the schema header.
#[derive(Debug, Clone)]
pub struct TemplateDef {
    pub plugin: String,
    pub name: String,
    pub description: String,
    pub custom_fields: RequiredFields,
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    description: String,
    #[serde(default)]
    custom_fields: BTreeMap<String, FieldSpec>,
}

/// Enumerates template definitions per plugin from
/// `<templates>/<plugin>/<name>.j2`.
pub struct TemplateRegistry {
    templates: BTreeMap<(String, String), TemplateDef>,
}

impl TemplateRegistry {
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, TemplateError> {
        let root = root.into();
        let mut templates = BTreeMap::new();

        if root.is_dir() {
            for plugin_entry in read_dir_sorted(&root)? {
                if !plugin_entry.is_dir() {
                    continue;
                }
                let plugin = file_name(&plugin_entry);
                for template_path in read_dir_sorted(&plugin_entry)? {
                    if template_path.extension().map(|e| e != "j2").unwrap_or(true) {
                        continue;
                    }
                    let name = template_path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let def = parse_template(&plugin, &name, &template_path)?;
                    templates.insert((plugin.clone(), name), def);
                }
            }
        }

        Ok(TemplateRegistry { templates })
    }

    /// Registry over in-memory definitions; test seam.
    pub fn from_templates(definitions: Vec<TemplateDef>) -> Self {
        TemplateRegistry {
            templates: definitions
                .into_iter()
                .map(|d| ((d.plugin.clone(), d.name.clone()), d))
                .collect(),
        }
    }

    pub fn lookup(&self, plugin: &str, name: &str) -> Result<&TemplateDef, TemplateError> {
        self.templates
            .get(&(plugin.to_string(), name.to_string()))
            .ok_or_else(|| TemplateError::NotFound {
                plugin: plugin.to_string(),
                template: name.to_string(),
            })
    }

    /// Assemble the per-job required-fields schema: a fold over the artifact
    /// list, union with merge-by-name. Duplicate names must agree on
    /// structure; a disagreement fails job creation. Commutative and
    /// idempotent over the artifact list.
    pub fn collect_schema(
        &self,
        artifacts: &[ArtifactSpec],
    ) -> Result<RequiredFields, TemplateError> {
        let mut fields = RequiredFields::new();
        let mut origins: BTreeMap<String, String> = BTreeMap::new();

        for artifact in artifacts {
            let template = self.lookup(&artifact.plugin, &artifact.template)?;
            for (name, spec) in &template.custom_fields {
                match fields.get(name) {
                    None => {
                        fields.insert(name.clone(), spec.clone());
                        origins.insert(name.clone(), template.name.clone());
                    }
                    Some(existing) if existing.structure == spec.structure => {}
                    Some(_) => {
                        return Err(TemplateError::SchemaConflict {
                            field: name.clone(),
                            first: origins
                                .get(name)
                                .cloned()
                                .unwrap_or_else(|| "unknown".into()),
                            second: template.name.clone(),
                        });
                    }
                }
            }
        }

        Ok(fields)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, TemplateError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| TemplateError::Io {
            path: dir.display().to_string(),
            source: e,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parse_template(plugin: &str, name: &str, path: &Path) -> Result<TemplateDef, TemplateError> {
    let raw = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let (front, body) = split_front_matter(&raw);

    let meta: FrontMatter = match front {
        Some(yaml) => serde_yaml::from_str(yaml).map_err(|e| TemplateError::BadFrontMatter {
            path: path.display().to_string(),
            message: e.to_string(),
        })?,
        None => FrontMatter::default(),
    };

    Ok(TemplateDef {
        plugin: plugin.to_string(),
        name: name.to_string(),
        description: meta.description,
        custom_fields: meta.custom_fields.into_iter().collect(),
        body: body.to_string(),
    })
}

/// Split optional YAML front matter delimited by `---` lines from the body.
fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    match rest.split_once("\n---") {
        Some((front, body)) => {
            let body = body.strip_prefix('\n').unwrap_or(body);
            (Some(front), body)
        }
        None => (None, content),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template not found: {plugin}/{template}")]
    NotFound { plugin: String, template: String },
    #[error("template schema conflict on field '{field}': {first} and {second} disagree on structure")]
    SchemaConflict {
        field: String,
        first: String,
        second: String,
    },
    #[error("unparseable front matter in {path}: {message}")]
    BadFrontMatter { path: String, message: String },
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
