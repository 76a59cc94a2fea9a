//! Reading playbook and event files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tw_core::events::Event;
use tw_core::playbook::PlaybookDefinition;

/// A playbook file holds either a bare list or a `playbooks:` key.
#[derive(Deserialize)]
#[serde(untagged)]
enum PlaybookFile {
    List(Vec<PlaybookDefinition>),
    Document { playbooks: Vec<PlaybookDefinition> },
}

/// Parses playbook definitions from YAML (or JSON) text.
pub fn parse_playbooks(contents: &str) -> Result<Vec<PlaybookDefinition>> {
    let file: PlaybookFile =
        serde_yaml::from_str(contents).context("Failed to parse playbook definitions")?;
    Ok(match file {
        PlaybookFile::List(playbooks) => playbooks,
        PlaybookFile::Document { playbooks } => playbooks,
    })
}

/// Loads playbook definitions from a file.
pub fn load_playbooks(path: &Path) -> Result<Vec<PlaybookDefinition>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read playbook file: {}", path.display()))?;
    parse_playbooks(&contents).with_context(|| format!("Invalid playbook file: {}", path.display()))
}

/// Loads an event from a JSON or YAML file.
pub fn load_event(path: &Path) -> Result<Event> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file: {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse event file: {}", path.display()))
    } else {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse event file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_core::playbook::TriggerType;

    const LIST: &str = r#"
- organization_id: 7f1b3c2e-9a4d-4e8f-b6a1-2c3d4e5f6a7b
  name: Notify
  trigger_type: alert
  steps:
    - id: log
      uses: log_message
      with:
        message: "Alert {{ event.entity_id }}"
"#;

    #[test]
    fn test_parse_list() {
        let playbooks = parse_playbooks(LIST).unwrap();
        assert_eq!(playbooks.len(), 1);
        assert_eq!(playbooks[0].trigger_type, TriggerType::Alert);
        assert_eq!(playbooks[0].steps[0].uses, "log_message");
    }

    #[test]
    fn test_parse_document() {
        let yaml = r#"
playbooks:
  - organization_id: 7f1b3c2e-9a4d-4e8f-b6a1-2c3d4e5f6a7b
    name: Incident
    trigger_type: incident
    is_active: false
"#;
        let playbooks = parse_playbooks(yaml).unwrap();
        assert_eq!(playbooks.len(), 1);
        assert!(!playbooks[0].is_active);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_playbooks("name: [unterminated").is_err());
        assert!(parse_playbooks("- name: missing fields").is_err());
    }
}
