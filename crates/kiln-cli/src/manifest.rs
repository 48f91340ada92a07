//! Build manifest
//!
//! A JSON file describing the step graph, either a bare list of steps or
//! `{ "properties": {...}, "steps": [...] }`:
//!
//! ```json
//! [
//!   { "id": "textures", "steps": [
//!       { "id": "albedo", "command": { "kind": "shell", "parameters": {
//!           "command": "convert albedo.png albedo.dds",
//!           "inputs": ["textures/*.png"], "outputs": ["albedo.dds"] } } }
//!   ] },
//!   { "id": "pack", "prerequisites": ["textures"],
//!     "command": { "kind": "copy", "parameters": {
//!         "source": "albedo.dds", "destination": "out/albedo.dds" } } }
//! ]
//! ```
//!
//! Relative paths and glob patterns in a command's `inputs` are resolved
//! against the manifest's directory.

use anyhow::{anyhow, bail, Context, Result};
use kiln_core::{link_build_steps, BuildStep, CommandPayload, CommandRegistry};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub id: String,
    /// Diagnostics label; defaults to the id
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub command: Option<CommandPayload>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Steps(Vec<StepSpec>),
    Document {
        #[serde(default)]
        properties: BTreeMap<String, String>,
        steps: Vec<StepSpec>,
    },
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub base_dir: PathBuf,
    pub properties: BTreeMap<String, String>,
    pub steps: Vec<StepSpec>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&content, base_dir)
            .with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn parse(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let (properties, steps) = match serde_json::from_str(content)? {
            ManifestFile::Steps(steps) => (BTreeMap::new(), steps),
            ManifestFile::Document { properties, steps } => (properties, steps),
        };
        Ok(Self {
            base_dir: base_dir.into(),
            properties,
            steps,
        })
    }

    /// Build the step graph; returns the top-level steps
    pub fn instantiate(&self, registry: &CommandRegistry) -> Result<Vec<Arc<BuildStep>>> {
        let mut by_id = HashMap::new();
        let mut links = Vec::new();
        let roots = self
            .steps
            .iter()
            .map(|spec| self.create_step(spec, registry, &mut by_id, &mut links))
            .collect::<Result<Vec<_>>>()?;

        for (dependent, prerequisite) in links {
            let prerequisite_step = by_id.get(&prerequisite).ok_or_else(|| {
                anyhow!(
                    "step '{}' depends on unknown step '{}'",
                    dependent,
                    prerequisite
                )
            })?;
            link_build_steps(prerequisite_step, &by_id[&dependent]);
        }
        Ok(roots)
    }

    fn create_step(
        &self,
        spec: &StepSpec,
        registry: &CommandRegistry,
        by_id: &mut HashMap<String, Arc<BuildStep>>,
        links: &mut Vec<(String, String)>,
    ) -> Result<Arc<BuildStep>> {
        let step = match &spec.command {
            Some(_) if !spec.steps.is_empty() => {
                bail!("step '{}' has both a command and nested steps", spec.id)
            }
            Some(payload) => {
                let payload = self.expand_inputs(payload)?;
                let command = registry
                    .create(&payload)
                    .with_context(|| format!("step '{}'", spec.id))?;
                BuildStep::from_boxed(command)
            }
            None => {
                let list = BuildStep::list();
                for child in &spec.steps {
                    list.add(self.create_step(child, registry, by_id, links)?)?;
                }
                list
            }
        };

        step.set_name(spec.id.clone());
        step.set_tag(spec.tag.clone().unwrap_or_else(|| spec.id.clone()));
        if let Some(module) = &spec.module {
            step.set_module(module.clone());
        }
        if let Some(priority) = spec.priority {
            step.set_priority(priority);
        }

        if by_id.insert(spec.id.clone(), step.clone()).is_some() {
            bail!("duplicate step id '{}'", spec.id);
        }
        for prerequisite in &spec.prerequisites {
            links.push((spec.id.clone(), prerequisite.clone()));
        }
        Ok(step)
    }

    fn expand_inputs(&self, payload: &CommandPayload) -> Result<CommandPayload> {
        let mut payload = payload.clone();
        let Some(inputs) = payload
            .parameters
            .get_mut("inputs")
            .and_then(Value::as_array_mut)
        else {
            return Ok(payload);
        };

        let mut expanded = Vec::with_capacity(inputs.len());
        for input in inputs.iter() {
            match input.as_str() {
                Some(pattern) if is_glob(pattern) => {
                    let full = self.resolve(pattern);
                    let full = full.to_string_lossy();
                    let mut matches: Vec<PathBuf> = glob::glob(&full)
                        .with_context(|| format!("invalid input pattern '{}'", pattern))?
                        .filter_map(|entry| entry.ok())
                        .filter(|path| path.is_file())
                        .collect();
                    matches.sort();
                    expanded.extend(
                        matches
                            .into_iter()
                            .map(|path| Value::String(path.to_string_lossy().into_owned())),
                    );
                }
                Some(path) => expanded.push(Value::String(
                    self.resolve(path).to_string_lossy().into_owned(),
                )),
                None => expanded.push(input.clone()),
            }
        }
        *inputs = expanded;
        Ok(payload)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.base_dir.join(path)
        }
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ShellCommand, StepKind};
    use tempfile::tempdir;

    fn registry() -> CommandRegistry {
        CommandRegistry::with_builtins()
    }

    #[test]
    fn test_nested_steps_and_prerequisites() {
        let manifest = Manifest::parse(
            r#"{
                "properties": { "platform": "linux" },
                "steps": [
                    { "id": "group", "priority": -1, "steps": [
                        { "id": "a", "command": { "kind": "shell", "parameters": { "command": "true" } } },
                        { "id": "b", "tag": "assets/b", "command": { "kind": "shell", "parameters": { "command": "true" } } }
                    ] },
                    { "id": "last", "prerequisites": ["group"], "module": "pack",
                      "command": { "kind": "shell", "parameters": { "command": "true" } } }
                ]
            }"#,
            ".",
        )
        .unwrap();
        assert_eq!(manifest.properties.get("platform").map(String::as_str), Some("linux"));

        let roots = manifest.instantiate(&registry()).unwrap();
        assert_eq!(roots.len(), 2);
        assert!(matches!(roots[0].kind(), StepKind::List(_)));
        assert_eq!(roots[0].children().len(), 2);
        assert_eq!(roots[0].priority(), Some(-1));
        assert_eq!(roots[0].children()[1].tag().as_deref(), Some("assets/b"));
        assert_eq!(roots[1].tag().as_deref(), Some("last"));
        assert_eq!(roots[1].module().as_deref(), Some("pack"));
        assert_eq!(roots[1].prerequisites().len(), 1);
        assert_eq!(roots[1].prerequisites()[0].id(), roots[0].id());
    }

    #[test]
    fn test_bad_references_are_rejected() {
        let unknown = Manifest::parse(
            r#"[{ "id": "a", "prerequisites": ["ghost"], "steps": [] }]"#,
            ".",
        )
        .unwrap();
        let err = unknown.instantiate(&registry()).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let duplicate = Manifest::parse(r#"[{ "id": "a" }, { "id": "a" }]"#, ".").unwrap();
        assert!(duplicate.instantiate(&registry()).is_err());

        let kind = Manifest::parse(
            r#"[{ "id": "a", "command": { "kind": "teleport", "parameters": {} } }]"#,
            ".",
        )
        .unwrap();
        assert!(kind.instantiate(&registry()).is_err());
    }

    #[test]
    fn test_input_globs_are_expanded() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        for name in ["b.txt", "a.txt", "skip.bin"] {
            std::fs::write(dir.path().join("src").join(name), name).unwrap();
        }

        let manifest = Manifest::parse(
            r#"[{ "id": "cat", "command": { "kind": "shell", "parameters": {
                "command": "cat src/*.txt", "inputs": ["src/*.txt", "extra.cfg", "/opt/shared.cfg"] } } }]"#,
            dir.path(),
        )
        .unwrap();
        let roots = manifest.instantiate(&registry()).unwrap();
        let parameters = roots[0].command_ref().unwrap().parameters();
        let shell: ShellCommand = serde_json::from_value(parameters).unwrap();
        assert_eq!(
            shell.inputs,
            vec![
                dir.path().join("src").join("a.txt"),
                dir.path().join("src").join("b.txt"),
                dir.path().join("extra.cfg"),
                PathBuf::from("/opt/shared.cfg"),
            ]
        );
    }
}
