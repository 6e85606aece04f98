//! Templates, hardware sizes and label resolution.
//!
//! A template names a mansion type, the VM spec to set up, the file system
//! paths whose contents survive VM replacement, and a broker account. The
//! catalog is loaded once at start-up; afterwards only `enabled` changes.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use mansion_id::TemplateId;
use mansion_throttle::HardwareSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::broker::VmSpec;

/// Catalog errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate template id: {0}")]
    Duplicate(TemplateId),

    #[error("unknown hardware size: {0}")]
    UnknownSize(String),
}

// =============================================================================
// Hardware sizes
// =============================================================================

/// Canonical broker hardware sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HardwareSize {
    #[default]
    Small,
    Large,
    XLarge,
}

impl HardwareSize {
    pub const ALL: [HardwareSize; 3] = [Self::Small, Self::Large, Self::XLarge];

    /// Broker name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Large => "large",
            Self::XLarge => "xlarge",
        }
    }

    /// Marketing alias shown to users, if any.
    pub fn alias(&self) -> Option<&'static str> {
        match self {
            Self::Small => None,
            Self::Large => Some("standard"),
            Self::XLarge => Some("hi-speed"),
        }
    }

    /// Parse a size token: canonical name, alias, or legacy box name.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "small" | "m1.small" => Some(Self::Small),
            "large" | "standard" | "m1.large" => Some(Self::Large),
            "xlarge" | "hi-speed" => Some(Self::XLarge),
            _ => None,
        }
    }

    pub fn to_spec(self) -> HardwareSpec {
        HardwareSpec::new(self.as_str())
    }
}

impl fmt::Display for HardwareSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareSize {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| TemplateError::UnknownSize(s.to_string()))
    }
}

impl TryFrom<String> for HardwareSize {
    type Error = TemplateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HardwareSize> for String {
    fn from(size: HardwareSize) -> Self {
        size.as_str().to_string()
    }
}

// =============================================================================
// Templates
// =============================================================================

fn default_enabled() -> bool {
    true
}

/// Catalog entry as written in the JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub id: TemplateId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub mansion_type: String,
    #[serde(default)]
    pub spec: VmSpec,
    #[serde(default)]
    pub persistent_paths: BTreeSet<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub default_size: HardwareSize,
    /// Only match labels that name this template explicitly.
    #[serde(default)]
    pub name_match_required: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A loaded template.
#[derive(Debug)]
pub struct Template {
    pub id: TemplateId,
    pub display_name: String,
    pub mansion_type: String,
    pub spec: VmSpec,
    pub persistent_paths: BTreeSet<String>,
    pub account: Option<String>,
    pub default_size: HardwareSize,
    pub name_match_required: bool,
    enabled: AtomicBool,
}

impl Template {
    pub fn from_definition(def: TemplateDefinition) -> Self {
        let display_name = def.display_name.unwrap_or_else(|| def.id.to_string());
        Self {
            id: def.id,
            display_name,
            mansion_type: def.mansion_type,
            spec: def.spec,
            persistent_paths: def.persistent_paths,
            account: def.account,
            default_size: def.default_size,
            name_match_required: def.name_match_required,
            enabled: AtomicBool::new(def.enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(template = %self.id, enabled, "template toggled");
    }

    /// Merge this template's spec into one built by the configurators.
    pub fn populate(&self, spec: &mut VmSpec) {
        spec.merge(&self.spec);
    }

    /// Scheduling label of nodes provisioned from this template.
    pub fn node_label(&self, size: HardwareSize) -> String {
        match size.alias() {
            Some(alias) => format!("{} {} {}", self.id, size, alias),
            None => format!("{} {}", self.id, size),
        }
    }
}

/// All templates, in catalog order.
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: Vec<Arc<Template>>,
}

impl TemplateCatalog {
    pub fn new(definitions: Vec<TemplateDefinition>) -> Result<Self, TemplateError> {
        let mut seen = BTreeSet::new();
        let mut templates = Vec::with_capacity(definitions.len());
        for def in definitions {
            if !seen.insert(def.id.clone()) {
                return Err(TemplateError::Duplicate(def.id));
            }
            templates.push(Arc::new(Template::from_definition(def)));
        }
        Ok(Self { templates })
    }

    /// Parse a JSON array of definitions.
    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        let definitions: Vec<TemplateDefinition> = serde_json::from_str(json)?;
        Self::new(definitions)
    }

    /// Load the catalog file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template catalog: {}", path.display()))?;
        let catalog = Self::from_json(&content)
            .with_context(|| format!("Failed to parse template catalog: {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            templates = catalog.len(),
            "Loaded template catalog"
        );
        Ok(catalog)
    }

    pub fn get(&self, id: &TemplateId) -> Option<Arc<Template>> {
        self.templates.iter().find(|t| &t.id == id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

// =============================================================================
// Label resolution
// =============================================================================

/// A label resolved to a template and hardware.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub template: Arc<Template>,
    pub size: HardwareSize,
}

/// Maps scheduling labels to templates.
pub trait LabelResolver: Send + Sync {
    fn resolve(&self, label: Option<&str>) -> Option<Resolution>;
}

/// Split a label expression into atoms on whitespace and `&&`.
pub fn label_atoms(label: &str) -> BTreeSet<&str> {
    label
        .split("&&")
        .flat_map(str::split_whitespace)
        .collect()
}

/// First size token among the atoms of `label`, if any.
pub fn size_in_label(label: Option<&str>) -> Option<HardwareSize> {
    label_atoms(label?)
        .into_iter()
        .find_map(HardwareSize::from_token)
}

/// Resolver over a [`TemplateCatalog`].
///
/// A label matches a template when every atom is either the template id or
/// a size token. Templates with `name_match_required` also need their id
/// among the atoms. No label matches the first template that does not
/// require a name match.
pub struct CatalogLabelResolver {
    catalog: Arc<TemplateCatalog>,
}

impl CatalogLabelResolver {
    pub fn new(catalog: Arc<TemplateCatalog>) -> Self {
        Self { catalog }
    }
}

impl LabelResolver for CatalogLabelResolver {
    fn resolve(&self, label: Option<&str>) -> Option<Resolution> {
        let atoms = label.map(label_atoms).unwrap_or_default();
        let template = self.catalog.iter().find(|t| {
            let named = atoms.contains(t.id.as_str());
            if t.name_match_required && !named {
                return false;
            }
            atoms
                .iter()
                .all(|a| *a == t.id.as_str() || HardwareSize::from_token(a).is_some())
        })?;
        let size = atoms
            .iter()
            .find_map(|a| HardwareSize::from_token(a))
            .unwrap_or(template.default_size);
        Some(Resolution {
            template: Arc::clone(template),
            size,
        })
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Maximum length of a node name derived from a VM id.
const MAX_NAME_LEN: usize = 8;

/// Turn a broker VM id into a node name.
///
/// Ids with a `/` or longer than eight characters become the first eight hex
/// digits of their SHA-256.
pub fn massage_id(id: &str) -> String {
    if id.contains('/') || id.len() > MAX_NAME_LEN {
        let digest = Sha256::digest(id.as_bytes());
        let mut name = hex::encode(digest);
        name.truncate(MAX_NAME_LEN);
        name
    } else {
        id.to_string()
    }
}
