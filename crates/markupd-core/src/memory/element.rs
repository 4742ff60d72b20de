//! Element identity
//!
//! Maps a DOM element descriptor to a stable key so that repeated selections
//! of the same element share one memory record.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Number of hex characters kept from the digest
const KEY_LEN: usize = 16;

/// Field separator inside the hashed material (ASCII unit separator)
const SEP: char = '\u{1f}';

/// Description of a DOM element, as produced by the page markup UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub class_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Ancestor path, outermost first (e.g. `["body", "main", "section.hero"]`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dom_path: Vec<String>,
    /// Computed CSS properties captured at selection time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub computed_styles: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
}

impl ElementDescriptor {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            ..Default::default()
        }
    }

    /// Class names sorted and deduplicated
    pub fn normalized_classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self
            .class_names
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        classes.sort_unstable();
        classes.dedup();
        classes
    }
}

/// Opaque, fixed-width key derived from an element descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementKey(String);

impl ElementKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the identity key of an element.
///
/// Only tag, id, classes (as a set) and selector participate; missing
/// fields hash as empty strings.
pub fn derive_key(descriptor: &ElementDescriptor) -> ElementKey {
    let mut material = String::new();
    material.push_str(&descriptor.tag_name);
    material.push(SEP);
    material.push_str(descriptor.id.as_deref().unwrap_or(""));
    material.push(SEP);
    for class in descriptor.normalized_classes() {
        material.push_str(class);
        material.push(' ');
    }
    material.push(SEP);
    material.push_str(descriptor.selector.as_deref().unwrap_or(""));

    let digest = Sha256::digest(material.as_bytes());
    let mut key = String::with_capacity(KEY_LEN);
    for b in digest.iter().take(KEY_LEN / 2) {
        key.push_str(&format!("{:02x}", b));
    }
    ElementKey(key)
}

/// The slice of a descriptor that is stored on a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSummary {
    pub tag_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub class_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl From<&ElementDescriptor> for ElementSummary {
    fn from(d: &ElementDescriptor) -> Self {
        Self {
            tag_name: d.tag_name.clone(),
            id: d.id.clone(),
            class_names: d.class_names.clone(),
            selector: d.selector.clone(),
        }
    }
}
