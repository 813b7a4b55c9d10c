//! The machine-class catalog: named capability bundles tenants request.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vmlet_api::ResourceList;

use crate::error::{ResourceError, Result};

/// A named capability bundle a tenant may request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineClass {
    pub name: String,
    pub capabilities: ResourceList,
}

/// Parses a machine-class document. JSON is tried first; anything that is
/// not JSON falls through to YAML, so both on-disk forms work.
pub fn load_classes(data: &str) -> Result<Vec<MachineClass>> {
    let classes: Vec<MachineClass> = match serde_json::from_str(data) {
        Ok(classes) => classes,
        Err(_) => serde_yaml::from_str(data)
            .map_err(|e| ResourceError::ClassFile(format!("not valid JSON or YAML: {e}")))?,
    };

    let mut names = BTreeSet::new();
    for class in &classes {
        if !names.insert(class.name.as_str()) {
            return Err(ResourceError::DuplicateClass(class.name.clone()));
        }
    }

    Ok(classes)
}

/// Reads and parses a machine-class file.
pub fn load_classes_file(path: impl AsRef<Path>) -> Result<Vec<MachineClass>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .map_err(|e| ResourceError::ClassFile(format!("{}: {e}", path.display())))?;
    load_classes(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_json() {
        let data = r#"[
            {"name": "t3-small", "capabilities": {"cpu": 2000, "memory": 2147483648}}
        ]"#;
        let classes = load_classes(data).unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].name, "t3-small");
        assert_eq!(classes[0].capabilities.get("cpu").unwrap().value(), 2000);
    }

    #[test]
    fn test_load_yaml() {
        let data = "
- name: t3-small
  capabilities:
    cpu: 2000
    memory: 2147483648
- name: x3-xlarge
  capabilities:
    cpu: 4000
    memory: 8589934592
";
        let classes = load_classes(data).unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(
            classes[1].capabilities.get("memory").unwrap().value(),
            8_589_934_592
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let data = r#"[
            {"name": "a", "capabilities": {"cpu": 1000, "memory": 1024}},
            {"name": "a", "capabilities": {"cpu": 2000, "memory": 2048}}
        ]"#;
        assert_eq!(
            load_classes(data),
            Err(ResourceError::DuplicateClass("a".to_string()))
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            load_classes("{{{"),
            Err(ResourceError::ClassFile(_))
        ));
    }
}
