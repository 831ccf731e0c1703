//! Deployment configuration.
//!
//! Loaded from YAML with permissive scalar handling: parameter, tag and
//! variable values may be numbers or booleans and coerce to strings. An
//! optional override file merges over the primary one, mapping by mapping.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Configuration of the whole deployment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the deployment; prefixes every remote stack name.
    #[serde(rename = "Name")]
    pub name: String,

    /// Target account id. When set, the manager verifies that the current
    /// credentials belong to this account.
    #[serde(rename = "AccountID")]
    pub account_id: String,

    /// Provider region.
    #[serde(rename = "Region")]
    pub region: String,

    /// Stacks managed by the deployment, in order.
    #[serde(rename = "Stacks")]
    pub stacks: Vec<StackConfig>,

    /// The bootstrap stack configuration.
    #[serde(rename = "Bootstrap")]
    pub bootstrap: StackConfig,

    /// Auxiliary files to sync into the artifact store.
    #[serde(rename = "Files")]
    pub files: BTreeMap<String, FileConfig>,

    /// Variables exposed to template rendering as `Var`.
    #[serde(rename = "Variables", deserialize_with = "permissive_string_map")]
    pub variables: BTreeMap<String, String>,

    /// Treat changes that only touch nested stacks automatically as no-ops.
    #[serde(rename = "IgnoreNestedUpdates")]
    pub ignore_nested_updates: bool,

    /// Name of the root stack; never verified through the parent hook.
    #[serde(rename = "RootStack")]
    pub root_stack: String,
}

/// Configuration of a single stack.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    #[serde(rename = "Name")]
    pub name: String,

    /// Local path of the stack template.
    #[serde(rename = "Template")]
    pub template: String,

    #[serde(rename = "RoleARN")]
    pub role_arn: String,

    #[serde(rename = "Parameters", deserialize_with = "permissive_string_map")]
    pub parameters: BTreeMap<String, String>,

    #[serde(rename = "Tags", deserialize_with = "permissive_string_map")]
    pub tags: BTreeMap<String, String>,

    #[serde(rename = "Capabilities")]
    pub capabilities: Vec<String>,
}

/// Configuration of a single auxiliary file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Local source path.
    #[serde(rename = "Src")]
    pub src: String,

    /// Target bucket; defaults to the bootstrap bucket.
    #[serde(rename = "Bucket")]
    pub bucket: String,

    /// Object key; defaults to the basename of `Src`.
    #[serde(rename = "Key")]
    pub key: String,
}

impl Config {
    /// Load the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        Self::load_with_override(path, None::<&Path>)
    }

    /// Load the configuration, merging an optional override file over the
    /// primary one.
    pub fn load_with_override(
        path: impl AsRef<Path>,
        override_path: Option<impl AsRef<Path>>,
    ) -> Result<Config> {
        let mut value = read_yaml(path.as_ref())?;
        if let Some(override_path) = override_path {
            let override_value = read_yaml(override_path.as_ref())?;
            merge_value(&mut value, override_value);
        }
        let config: Config = serde_yaml::from_value(value)
            .map_err(|e| Error::config(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("'Name' is required"));
        }
        if self.bootstrap.template.is_empty() {
            return Err(Error::config("'Bootstrap' requires a 'Template'"));
        }
        for stack in &self.stacks {
            if stack.name.is_empty() {
                return Err(Error::config("every stack requires a 'Name'"));
            }
            if stack.template.is_empty() {
                return Err(Error::config(format!(
                    "stack '{}' requires a 'Template'",
                    stack.name
                )));
            }
        }
        for (name, file) in &self.files {
            if file.src.is_empty() {
                return Err(Error::config(format!("file '{name}' requires a 'Src'")));
            }
        }
        Ok(())
    }
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, &e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| Error::config(format!("syntax error in {}: {e}", path.display())))
}

/// Merge `over` into `base`. Mappings merge key by key, recursing; anything
/// else is replaced by the override.
fn merge_value(base: &mut serde_yaml::Value, over: serde_yaml::Value) {
    use serde_yaml::Value;
    match (base, over) {
        (Value::Mapping(base), Value::Mapping(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

/// Deserialize a string map accepting numeric and boolean scalars.
fn permissive_string_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw {
        let value = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                return Err(D::Error::custom(format!(
                    "value for '{key}' is not a scalar: {other:?}"
                )))
            }
        };
        out.insert(key, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const BASE: &str = r#"
Name: demo
AccountID: "123456789012"
Region: eu-central-1
Bootstrap:
  Template: templates/bootstrap.yml
Stacks:
  - Name: network
    Template: templates/network.yml
    Parameters:
      CidrBlock: 10.0.0.0/16
      Port: 8080
      Enabled: true
  - Name: app
    Template: templates/app.yml
    Capabilities:
      - CAPABILITY_IAM
Files:
  script:
    Src: files/setup.sh
Variables:
  env: prod
  replicas: 3
"#;

    #[test]
    fn test_load_full_config() {
        let file = write_config(BASE);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.name, "demo");
        assert_eq!(config.stacks.len(), 2);
        assert_eq!(config.stacks[0].name, "network");
        assert_eq!(config.stacks[1].capabilities, vec!["CAPABILITY_IAM"]);
        assert_eq!(config.files["script"].src, "files/setup.sh");
        assert_eq!(config.variables["env"], "prod");
    }

    #[test]
    fn test_scalars_coerce_to_strings() {
        let file = write_config(BASE);
        let config = Config::load(file.path()).unwrap();

        let params = &config.stacks[0].parameters;
        assert_eq!(params["Port"], "8080");
        assert_eq!(params["Enabled"], "true");
        assert_eq!(config.variables["replicas"], "3");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let file = write_config(
            "Name: demo\nBootstrap:\n  Template: t.yml\nSomethingElse: 42\n",
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.name, "demo");
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let file = write_config("Bootstrap:\n  Template: t.yml\n");
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("'Name' is required"));
    }

    #[test]
    fn test_missing_stack_template_is_an_error() {
        let file = write_config(
            "Name: demo\nBootstrap:\n  Template: t.yml\nStacks:\n  - Name: app\n",
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("requires a 'Template'"));
    }

    #[test]
    fn test_override_merges_mappings_and_replaces_scalars() {
        let base = write_config(BASE);
        let over = write_config(
            r#"
Region: us-east-1
Variables:
  env: staging
"#,
        );
        let config = Config::load_with_override(base.path(), Some(over.path())).unwrap();

        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.variables["env"], "staging");
        // Untouched keys survive the merge.
        assert_eq!(config.variables["replicas"], "3");
        assert_eq!(config.name, "demo");
        assert_eq!(config.stacks.len(), 2);
    }
}
