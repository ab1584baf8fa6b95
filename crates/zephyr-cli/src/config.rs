//! Project configuration loading.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use zephyr_core::pipeline::ProjectConfig;
use zephyr_core::run::Project;

/// Read and parse a declarative project configuration file.
pub fn load_project_config(path: impl AsRef<Path>) -> Result<ProjectConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    let config: ProjectConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

/// Config source for the server: re-reads each project's file on demand
/// so edits take effect on the next trigger.
pub struct YamlConfigLoader;

#[async_trait]
impl zephyr_scheduler::ConfigLoader for YamlConfigLoader {
    async fn load(&self, project: &Project) -> zephyr_core::Result<ProjectConfig> {
        let path = project.config_path.clone();
        let config = tokio::task::spawn_blocking(move || load_project_config(&path))
            .await
            .map_err(|e| zephyr_core::Error::Internal(e.to_string()))?
            .map_err(|e| zephyr_core::Error::InvalidConfig(format!("{e:#}")))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
project:
  name: widget
  description: demo project
pipelines:
  - name: ci
    triggers:
      - type: push
        branches: [main]
    env:
      RUST_BACKTRACE: "1"
    jobs:
      - name: build
        runner:
          image: rust:1.81
          kind: local
        steps:
          - name: compile
            type: run
            command: cargo build
"#
        )
        .unwrap();

        let config = load_project_config(file.path()).unwrap();
        assert_eq!(config.project.name, "widget");
        match &config.pipelines {
            zephyr_core::pipeline::PipelinesSource::Static(p) => {
                assert_eq!(p.len(), 1);
                assert_eq!(p[0].jobs[0].name, "build");
            }
            _ => panic!("yaml configs are always static"),
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_project_config("/nonexistent/zephyr.yaml").is_err());
    }
}
