use std::path::Path;

use anyhow::Context as _;
use volley_core::ScriptConfig;

pub(crate) async fn load_script(path: &Path) -> anyhow::Result<ScriptConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read script: {}", path.display()))?;
    parse_script(&raw).with_context(|| format!("invalid script: {}", path.display()))
}

pub(crate) fn parse_script(raw: &str) -> anyhow::Result<ScriptConfig> {
    // Go through a JSON value so flow steps keep the shape engines expect.
    let yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("failed to parse YAML")?;
    let json = serde_json::to_value(yaml).context("script is not representable as JSON")?;
    serde_json::from_value(json).context("script does not match the expected shape")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_phases_scenarios_and_plugins() {
        let raw = r#"
phases:
  - name: warm up
    duration: 10s
    arrivalRate: 1
    rampTo: 5
  - pause: 2
  - duration: 1m
    arrivalCount: 30
    maxVusers: 4
scenarios:
  - name: browse
    engine: synthetic
    weight: 3
    beforeScenario: login
    flow:
      - request: { latency: 20ms }
      - think: 0.5
      - loop:
          - request: {}
        count: 2
plugins:
  metrics-by-endpoint:
    optional: true
"#;
        let script = match parse_script(raw) {
            Ok(s) => s,
            Err(err) => panic!("parse failed: {err:#}"),
        };

        assert_eq!(script.phases.len(), 3);
        assert_eq!(script.phases[0].name.as_deref(), Some("warm up"));
        assert_eq!(
            script.phases[0].duration.map(|d| d.0),
            Some(Duration::from_secs(10))
        );
        assert_eq!(script.phases[0].ramp_to, Some(5.0));
        assert_eq!(script.phases[1].pause.map(|d| d.0), Some(Duration::from_secs(2)));
        assert_eq!(script.phases[2].arrival_count, Some(30));
        assert_eq!(script.phases[2].max_vusers, Some(4));

        let s = &script.scenarios[0];
        assert_eq!(s.weight, Some(3));
        assert_eq!(s.before_scenario, vec!["login".to_string()]);
        assert_eq!(s.flow.len(), 3);
        assert!(script.plugins.contains_key("metrics-by-endpoint"));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(parse_script("phases: [").is_err());
        assert!(parse_script("phases: 3").is_err());
    }
}
