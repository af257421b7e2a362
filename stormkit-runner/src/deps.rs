//! JavaScript dependency resolution.
//!
//! Scans built server output for `import`/`require` forms, intersects the
//! candidates with the packages the repo actually declares, then expands
//! transitively through each package's own `dependencies` and
//! `peerDependencies`. The walk is a directed graph with cycles; a visited
//! set keyed by package name breaks them.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Recognizes `import '...'`, `import x from '...'`, `require('...')` and
/// `import('...')`; the module name is the last capture.
const FIND_DEPENDENCY_PATTERN: &str = concat!(
    r#"(import\s+([:\w{}\s\*,'"]+\s+from\s+)?|require\(|import\()"#,
    r#"['"]([\w@/\-]+)['"]"#,
);

fn dependency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FIND_DEPENDENCY_PATTERN).expect("dependency pattern compiles"))
}

/// `bundleDependencies` accepts `true` (everything), `false` (nothing) or
/// an explicit list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BundleDependencies(pub Vec<String>);

impl<'de> Deserialize<'de> for BundleDependencies {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            List(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => BundleDependencies(vec!["*".to_string()]),
            Raw::Flag(false) => BundleDependencies(Vec::new()),
            Raw::List(list) => BundleDependencies(list),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageJson {
    pub name: String,
    pub version: String,
    pub workspaces: Vec<String>,
    pub scripts: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
    pub peer_dependencies: BTreeMap<String, String>,
    pub bundle_dependencies: BundleDependencies,
    /// Alternative spelling accepted by npm.
    pub bundled_dependencies: BundleDependencies,
}

impl PackageJson {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::info!("cannot parse {}: {e}", path.display());
                None
            }
        }
    }

    /// The effective bundle seed, either spelling.
    pub fn bundle_seed(&self) -> Vec<String> {
        if !self.bundle_dependencies.0.is_empty() {
            self.bundle_dependencies.0.clone()
        } else {
            self.bundled_dependencies.0.clone()
        }
    }

    /// Names declared under `dependencies` ∪ `devDependencies`.
    pub fn declared(&self) -> HashSet<String> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .cloned()
            .collect()
    }
}

/// Remove `//` and `/* */` comments before scanning.
pub fn remove_js_comments(code: &str) -> String {
    static SINGLE: OnceLock<Regex> = OnceLock::new();
    static MULTI: OnceLock<Regex> = OnceLock::new();

    let single = SINGLE.get_or_init(|| Regex::new(r"//.*").expect("pattern compiles"));
    let multi = MULTI.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("pattern compiles"));

    let without_multi = multi.replace_all(code, "");
    single.replace_all(&without_multi, "").trim().to_string()
}

/// Module names imported by one source file.
pub fn find_imports(code: &str) -> Vec<String> {
    let cleaned = remove_js_comments(code);
    dependency_regex()
        .captures_iter(&cleaned)
        .filter_map(|captures| captures.get(3).map(|m| m.as_str().to_string()))
        .collect()
}

/// Walk every `.js|.mjs|.cjs` file under `source_dir` and collect the
/// imported module names that appear in `declared`.
pub fn find_declared_dependencies(
    source_dir: &Path,
    declared: &HashSet<String>,
) -> std::io::Result<Vec<String>> {
    let mut found = Vec::new();
    let mut stack = vec![source_dir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }

            let is_js = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| matches!(ext, "js" | "mjs" | "cjs"));
            if !is_js {
                continue;
            }

            let code = std::fs::read_to_string(&path)?;
            for module in find_imports(&code) {
                if declared.contains(&module) && !found.contains(&module) {
                    found.push(module);
                }
            }
        }
    }

    Ok(found)
}

/// A resolved package ready to be copied into the bundle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolvedDependency {
    pub name: String,
    pub full_path: PathBuf,
}

/// Transitive dependency expansion over `node_modules`.
pub struct DependencyTree {
    node_modules: PathBuf,
    requested: Vec<String>,
    resolved: HashMap<String, bool>,
}

impl DependencyTree {
    pub fn new(requested: Vec<String>, node_modules: impl Into<PathBuf>) -> Self {
        Self {
            node_modules: node_modules.into(),
            requested,
            resolved: HashMap::new(),
        }
    }

    /// Expand the requested set. Safe on cyclic graphs.
    pub fn walk(&mut self) {
        let requested = self.requested.clone();
        self.walk_level(&requested);
    }

    fn walk_level(&mut self, deps: &[String]) {
        for dep in deps {
            if self.resolved.contains_key(dep) {
                continue;
            }
            self.resolved.insert(dep.clone(), true);

            let children = self.child_dependencies(dep);
            if !children.is_empty() {
                self.walk_level(&children);
            }
        }
    }

    /// `dependencies` ∪ `peerDependencies` of one installed package.
    fn child_dependencies(&self, dependency: &str) -> Vec<String> {
        let manifest = self.node_modules.join(dependency).join("package.json");
        let Some(package) = PackageJson::load(&manifest) else {
            return Vec::new();
        };

        package
            .dependencies
            .keys()
            .chain(package.peer_dependencies.keys())
            .cloned()
            .collect()
    }

    pub fn resolved_dependencies(&self) -> Vec<ResolvedDependency> {
        let mut resolved: Vec<ResolvedDependency> = self
            .resolved
            .keys()
            .map(|name| ResolvedDependency {
                name: name.clone(),
                full_path: self.node_modules.join(name),
            })
            .collect();
        resolved.sort();
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_imports_forms() {
        let code = r#"
            import fs from 'node:fs';
            import { json } from "express";
            import 'dotenv/config';
            const lib = require('lodash');
            const lazy = import('@scope/pkg');
        "#;

        let imports = find_imports(code);
        assert!(imports.contains(&"express".to_string()));
        assert!(imports.contains(&"dotenv/config".to_string()));
        assert!(imports.contains(&"lodash".to_string()));
        assert!(imports.contains(&"@scope/pkg".to_string()));
    }

    #[test]
    fn test_comments_are_ignored() {
        let code = r#"
            // const disabled = require('commented-out');
            /* import hidden from 'also-commented'; */
            const real = require('kept');
        "#;

        let imports = find_imports(code);
        assert_eq!(imports, vec!["kept"]);
    }

    #[test]
    fn test_remove_js_comments() {
        assert_eq!(remove_js_comments("a // trailing"), "a");
        assert_eq!(remove_js_comments("a /* x\ny */ b"), "a  b");
    }

    #[test]
    fn test_bundle_dependencies_forms() {
        let all: PackageJson =
            serde_json::from_str(r#"{"bundleDependencies": true}"#).unwrap();
        assert_eq!(all.bundle_seed(), vec!["*"]);

        let none: PackageJson =
            serde_json::from_str(r#"{"bundleDependencies": false}"#).unwrap();
        assert!(none.bundle_seed().is_empty());

        let list: PackageJson =
            serde_json::from_str(r#"{"bundledDependencies": ["a", "b"]}"#).unwrap();
        assert_eq!(list.bundle_seed(), vec!["a", "b"]);
    }

    fn write_package(node_modules: &Path, name: &str, json: &str) {
        let dir = node_modules.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), json).unwrap();
    }

    #[test]
    fn test_walk_expands_transitively() {
        let temp = TempDir::new().unwrap();
        let node_modules = temp.path().join("node_modules");

        write_package(&node_modules, "a", r#"{"dependencies": {"b": "1"}}"#);
        write_package(&node_modules, "b", r#"{"peerDependencies": {"c": "1"}}"#);
        write_package(&node_modules, "c", r#"{}"#);

        let mut tree = DependencyTree::new(vec!["a".to_string()], &node_modules);
        tree.walk();

        let names: Vec<String> = tree
            .resolved_dependencies()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_walk_survives_cycles() {
        let temp = TempDir::new().unwrap();
        let node_modules = temp.path().join("node_modules");

        write_package(&node_modules, "a", r#"{"dependencies": {"b": "1"}}"#);
        write_package(&node_modules, "b", r#"{"dependencies": {"a": "1"}}"#);

        let mut tree = DependencyTree::new(vec!["a".to_string()], &node_modules);
        tree.walk();

        assert_eq!(tree.resolved_dependencies().len(), 2);
    }

    #[test]
    fn test_find_declared_dependencies_filters_to_declared() {
        let temp = TempDir::new().unwrap();
        let server = temp.path().join("server");
        std::fs::create_dir_all(server.join("nested")).unwrap();
        std::fs::write(
            server.join("index.mjs"),
            "import express from 'express';\nimport fs from 'node:fs';",
        )
        .unwrap();
        std::fs::write(
            server.join("nested").join("db.cjs"),
            "const pg = require('pg');",
        )
        .unwrap();
        std::fs::write(server.join("readme.txt"), "require('ignored')").unwrap();

        let declared: HashSet<String> =
            ["express", "pg"].iter().map(|s| s.to_string()).collect();

        let mut found = find_declared_dependencies(&server, &declared).unwrap();
        found.sort();
        assert_eq!(found, vec!["express", "pg"]);
    }
}
