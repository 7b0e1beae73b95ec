//! Deployment group loader (`spec.md` §12 / original `deployment_loader.py`
//! `DeploymentLoader`).
//!
//! Loads `deployment_groups.yaml` plus three auxiliary YAML files
//! (`delegation_patterns.yaml`, `collaboration_patterns.yaml`,
//! `execution_presets.yaml`) and shallow-joins each group's pattern/preset
//! references against them. Unlike the Python original there is no
//! process-wide cached singleton (`get_deployment_loader`'s module-level
//! `_deployment_loader`) — callers construct a `DeploymentLoader` explicitly
//! and hold it for as long as they need it, per `spec.md`'s own note that a
//! hidden global defeats testability.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

/// One agent entry inside a deployment group.
///
/// `process_backlog` is carried for backward compatibility only — it has
/// no effect on pipeline behavior (`spec.md` §12 Open Question (c)).
#[derive(Debug, Clone, Default)]
pub struct DeploymentAgent {
    pub id: String,
    pub role: Option<String>,
    pub monitor: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub start_delay_ms: Option<u64>,
    /// Deprecated, inert: no pipeline behavior reads this field.
    pub process_backlog: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub defaults: HashMap<String, Value>,
    pub agents: Vec<DeploymentAgent>,
    pub tags: Vec<String>,
    pub environment: String,
    pub delegation_pattern: Option<String>,
    pub collaboration_pattern: Option<String>,
    pub mcp_servers: Vec<String>,
    pub execution_preset: Option<String>,
    pub delegation_pattern_details: Option<Value>,
    pub collaboration_pattern_details: Option<Value>,
    pub mcp_server_details: Vec<Value>,
    pub execution_preset_details: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct DeploymentGroupsFile {
    #[serde(default)]
    deployment_groups: HashMap<String, Value>,
}

/// Loads and shallow-joins deployment groups from `<base_dir>/configs/`.
pub struct DeploymentLoader {
    base_dir: PathBuf,
    groups: HashMap<String, DeploymentGroup>,
    delegation_patterns: HashMap<String, Value>,
    collaboration_patterns: HashMap<String, Value>,
    mcp_servers: HashMap<String, Value>,
    mcp_server_groups: HashMap<String, Value>,
    execution_presets: HashMap<String, Value>,
}

impl DeploymentLoader {
    /// Constructs and performs an initial `reload()` against `base_dir`.
    /// `known_agents` stands in for the original's `ConfigLoader.list_configs()`
    /// scan of `configs/agents/` — callers pass the agent ids they already
    /// know about so an unknown reference can be skipped rather than failed.
    pub fn new(base_dir: impl Into<PathBuf>, known_agents: &[String]) -> Self {
        let mut loader = Self {
            base_dir: base_dir.into(),
            groups: HashMap::new(),
            delegation_patterns: HashMap::new(),
            collaboration_patterns: HashMap::new(),
            mcp_servers: HashMap::new(),
            mcp_server_groups: HashMap::new(),
            execution_presets: HashMap::new(),
        };
        loader.reload(known_agents);
        loader
    }

    /// Reloads every group from disk, replacing the previous snapshot.
    /// A group that fails to parse, or resolves to zero valid agents, is
    /// skipped and logged rather than aborting the whole reload.
    pub fn reload(&mut self, known_agents: &[String]) {
        self.groups.clear();
        self.load_orchestration_configs();

        let config_path = self.base_dir.join("configs/deployment_groups.yaml");
        let Some(raw) = self.load_yaml_file(&config_path) else {
            return;
        };
        let file: DeploymentGroupsFile = match serde_yaml::from_value(Value::Mapping(raw)) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "error loading deployment groups");
                return;
            }
        };

        let known: std::collections::HashSet<&str> = known_agents.iter().map(String::as_str).collect();

        for (group_id, group_info) in file.deployment_groups {
            match self.parse_group(&group_id, &group_info, &known) {
                Ok(Some(group)) => {
                    self.groups.insert(group_id, group);
                }
                Ok(None) => {
                    tracing::info!(group = %group_id, "deployment group has no valid agents");
                }
                Err(e) => {
                    tracing::warn!(group = %group_id, error = %e, "skipping deployment group");
                }
            }
        }
    }

    fn load_orchestration_configs(&mut self) {
        self.delegation_patterns = self.load_yaml_section("configs/delegation_patterns.yaml", "delegation_patterns");
        self.collaboration_patterns =
            self.load_yaml_section("configs/collaboration_patterns.yaml", "collaboration_patterns");

        let mcp_data = self
            .load_yaml_file(&self.base_dir.join("configs/mcp_servers.yaml"))
            .unwrap_or_default();
        self.mcp_servers = mapping_section(&mcp_data, "mcp_servers");
        self.mcp_server_groups = mapping_section(&mcp_data, "server_groups");

        self.execution_presets = self.load_yaml_section("configs/execution_presets.yaml", "execution_presets");
    }

    fn load_yaml_file(&self, path: &Path) -> Option<serde_yaml::Mapping> {
        if !path.exists() {
            return None;
        }
        let text = std::fs::read_to_string(path).ok()?;
        let value: Value = serde_yaml::from_str(&text).ok()?;
        match value {
            Value::Mapping(m) => Some(m),
            Value::Null => Some(serde_yaml::Mapping::new()),
            _ => {
                tracing::warn!(path = %path.display(), "root node must be a mapping");
                None
            }
        }
    }

    fn load_yaml_section(&self, relative_path: &str, section_key: &str) -> HashMap<String, Value> {
        let data = self
            .load_yaml_file(&self.base_dir.join(relative_path))
            .unwrap_or_default();
        mapping_section(&data, section_key)
    }

    fn parse_group(
        &self,
        group_id: &str,
        group_info: &Value,
        known_agents: &std::collections::HashSet<&str>,
    ) -> Result<Option<DeploymentGroup>, String> {
        let group_info = group_info
            .as_mapping()
            .ok_or_else(|| "group definition must be a mapping".to_string())?;

        let name = string_field(group_info, "name")
            .unwrap_or_else(|| group_id.replace('_', " "));
        let description = string_field(group_info, "description").unwrap_or_default();
        let defaults = group_info
            .get("defaults")
            .and_then(Value::as_mapping)
            .map(|m| m.iter().filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone()))).collect())
            .unwrap_or_default();
        let tags = string_list_field(group_info, "tags");
        let environment = string_field(group_info, "environment").unwrap_or_else(|| "any".to_string());

        let delegation_pattern = normalize_string(group_info.get("delegation_pattern"));
        let collaboration_pattern = normalize_string(group_info.get("collaboration_pattern"));
        let execution_preset = normalize_string(group_info.get("execution_preset"));
        let mcp_servers = normalize_list(group_info.get("mcp_servers"));

        let delegation_pattern_details = get_mapping_entry(&self.delegation_patterns, delegation_pattern.as_deref());
        let collaboration_pattern_details =
            get_mapping_entry(&self.collaboration_patterns, collaboration_pattern.as_deref());
        let execution_preset_details = get_mapping_entry(&self.execution_presets, execution_preset.as_deref());
        let mcp_server_details = self.resolve_mcp_servers(&mcp_servers);

        let agents_value = group_info
            .get("agents")
            .and_then(Value::as_sequence)
            .ok_or_else(|| "group must define an 'agents' list".to_string())?;

        let mut agents = Vec::new();
        let mut skipped = 0usize;
        for raw_agent in agents_value {
            match parse_agent(raw_agent, group_id, known_agents) {
                ParsedAgent::Included(agent) => agents.push(agent),
                ParsedAgent::Skipped => skipped += 1,
                ParsedAgent::Invalid => continue,
            }
        }
        if skipped > 0 {
            tracing::info!(group = %group_id, loaded = agents.len(), skipped, "deployment agents skipped");
        }

        if agents.is_empty() {
            return Ok(None);
        }

        Ok(Some(DeploymentGroup {
            id: group_id.to_string(),
            name,
            description,
            defaults,
            agents,
            tags,
            environment,
            delegation_pattern,
            collaboration_pattern,
            mcp_servers,
            execution_preset,
            delegation_pattern_details,
            collaboration_pattern_details,
            mcp_server_details,
            execution_preset_details,
        }))
    }

    fn resolve_mcp_servers(&self, references: &[String]) -> Vec<Value> {
        references
            .iter()
            .filter_map(|reference| {
                let entry = self
                    .mcp_server_groups
                    .get(reference)
                    .or_else(|| self.mcp_servers.get(reference))?;
                let mut mapping = entry.as_mapping()?.clone();
                mapping.insert(Value::String("id".to_string()), Value::String(reference.clone()));
                Some(Value::Mapping(mapping))
            })
            .collect()
    }

    pub fn list_groups(&self, environment: Option<&str>) -> Vec<&DeploymentGroup> {
        let groups: Vec<&DeploymentGroup> = self.groups.values().collect();
        match environment {
            Some(env) if env != "any" => groups
                .into_iter()
                .filter(|g| g.environment == "any" || g.environment == env)
                .collect(),
            _ => groups,
        }
    }

    pub fn get_group(&self, group_id: &str) -> Option<&DeploymentGroup> {
        self.groups.get(group_id)
    }
}

enum ParsedAgent {
    Included(DeploymentAgent),
    Skipped,
    Invalid,
}

fn parse_agent(raw_agent: &Value, group_id: &str, known_agents: &std::collections::HashSet<&str>) -> ParsedAgent {
    let (agent_id, fields): (String, serde_yaml::Mapping) = match raw_agent {
        Value::String(s) => (s.clone(), serde_yaml::Mapping::new()),
        Value::Mapping(m) => {
            let Some(Value::String(id)) = m.get("id") else {
                tracing::warn!(group = %group_id, "skipping agent entry without 'id'");
                return ParsedAgent::Invalid;
            };
            (id.clone(), m.clone())
        }
        _ => {
            tracing::warn!(group = %group_id, "skipping invalid agent entry");
            return ParsedAgent::Invalid;
        }
    };

    if !known_agents.contains(agent_id.as_str()) {
        if agent_id.starts_with("YOUR_") || agent_id.to_uppercase().contains("EXAMPLE") {
            tracing::info!(agent = %agent_id, "placeholder agent id - replace with an actual agent id");
        } else {
            tracing::warn!(agent = %agent_id, group = %group_id, "agent not found in known configs - skipping");
        }
        return ParsedAgent::Skipped;
    }

    ParsedAgent::Included(DeploymentAgent {
        id: agent_id,
        role: string_field(&fields, "role"),
        monitor: string_field(&fields, "monitor"),
        provider: string_field(&fields, "provider"),
        model: string_field(&fields, "model"),
        system_prompt: string_field(&fields, "system_prompt"),
        start_delay_ms: fields.get("start_delay_ms").and_then(Value::as_u64),
        process_backlog: fields.get("process_backlog").and_then(Value::as_bool),
    })
}

fn mapping_section(data: &serde_yaml::Mapping, key: &str) -> HashMap<String, Value> {
    data.get(key)
        .and_then(Value::as_mapping)
        .map(|m| m.iter().filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone()))).collect())
        .unwrap_or_default()
}

fn string_field(mapping: &serde_yaml::Mapping, key: &str) -> Option<String> {
    mapping.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_list_field(mapping: &serde_yaml::Mapping, key: &str) -> Vec<String> {
    mapping
        .get(key)
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn normalize_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn normalize_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn get_mapping_entry(source: &HashMap<String, Value>, key: Option<&str>) -> Option<Value> {
    let key = key?;
    let entry = source.get(key)?.as_mapping()?;
    let mut cloned = entry.clone();
    cloned.insert(Value::String("id".to_string()), Value::String(key.to_string()));
    Some(Value::Mapping(cloned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn missing_config_file_yields_no_groups() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DeploymentLoader::new(dir.path(), &[]);
        assert!(loader.list_groups(None).is_empty());
    }

    #[test]
    fn unknown_agents_are_skipped_and_empty_groups_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "configs/deployment_groups.yaml",
            r#"
deployment_groups:
  gcp_team:
    name: GCP Team
    agents:
      - agent-a
      - id: agent-ghost
  empty_group:
    agents:
      - id: agent-ghost
"#,
        );
        let known = vec!["agent-a".to_string()];
        let loader = DeploymentLoader::new(dir.path(), &known);

        let gcp = loader.get_group("gcp_team").expect("group should survive with 1 valid agent");
        assert_eq!(gcp.agents.len(), 1);
        assert_eq!(gcp.agents[0].id, "agent-a");

        assert!(loader.get_group("empty_group").is_none());
    }

    #[test]
    fn delegation_pattern_is_shallow_joined() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "configs/delegation_patterns.yaml",
            r#"
delegation_patterns:
  hierarchical:
    strategy: top-down
"#,
        );
        write(
            dir.path(),
            "configs/deployment_groups.yaml",
            r#"
deployment_groups:
  gcp_team:
    delegation_pattern: hierarchical
    agents:
      - agent-a
"#,
        );
        let loader = DeploymentLoader::new(dir.path(), &["agent-a".to_string()]);
        let group = loader.get_group("gcp_team").unwrap();
        let details = group.delegation_pattern_details.as_ref().unwrap();
        assert_eq!(details.get("id").unwrap().as_str(), Some("hierarchical"));
        assert_eq!(details.get("strategy").unwrap().as_str(), Some("top-down"));
    }

    #[test]
    fn environment_filter_includes_any() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "configs/deployment_groups.yaml",
            r#"
deployment_groups:
  staging_only:
    environment: staging
    agents:
      - agent-a
  universal:
    agents:
      - agent-a
"#,
        );
        let loader = DeploymentLoader::new(dir.path(), &["agent-a".to_string()]);
        let prod = loader.list_groups(Some("production"));
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].id, "universal");
    }
}
