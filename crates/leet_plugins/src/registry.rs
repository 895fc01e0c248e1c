//! Compile-time plugin registry.
//!
//! The statically linked equivalent of a plugin-directory scan: every
//! constructor in `BUILTIN` is loaded in order and a later plugin with the
//! same name wins. `reload` re-runs the scan.

use std::collections::BTreeMap;

use leet_protocol::Plugin;
use tracing::debug;

use crate::{dirlist, file_download, process_list};

type Constructor = fn() -> Box<dyn Plugin>;

const BUILTIN: &[Constructor] = &[
    dirlist::plugin,
    file_download::plugin,
    process_list::plugin,
];

pub struct PluginRegistry {
    plugins: BTreeMap<String, Constructor>,
}

impl PluginRegistry {
    pub fn load() -> Self {
        let mut plugins: BTreeMap<String, Constructor> = BTreeMap::new();
        for constructor in BUILTIN {
            let instance = constructor();
            let name = instance.name().to_string();
            if plugins.insert(name.clone(), *constructor).is_some() {
                debug!("plugin {} was redefined; the last definition wins", name);
            }
        }
        debug!("loaded {} plugins", plugins.len());
        Self { plugins }
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    /// A fresh, parameterless instance of the named plugin.
    pub fn get(&self, name: &str) -> Option<Box<dyn Plugin>> {
        self.plugins.get(name).map(|constructor| constructor())
    }

    pub fn reload(&mut self) {
        *self = Self::load();
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_ins_are_present() {
        let registry = PluginRegistry::load();
        assert_eq!(
            registry.names(),
            vec!["dirlist", "file_download", "process_list"]
        );
    }

    #[test]
    fn instances_are_fresh() {
        let registry = PluginRegistry::load();
        let mut first = registry.get("dirlist").unwrap();
        first
            .parse_parameters(&["--path".to_string(), r"c:\".to_string()])
            .unwrap();
        // a second instance has no parameters yet
        let second = registry.get("dirlist").unwrap();
        assert!(second
            .run(&mut leet_test_utils::NullSession, &leet_test_utils::NullMachine)
            .is_err());
    }

    #[test]
    fn reload_is_a_rescan() {
        let mut registry = PluginRegistry::load();
        let before = registry.names();
        registry.reload();
        assert_eq!(registry.names(), before);
    }

    #[test]
    fn unknown_plugin_is_none() {
        assert!(PluginRegistry::load().get("nope").is_none());
    }
}
