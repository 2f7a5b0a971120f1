use std::collections::HashMap;
use std::path::Path;

/// Load a flat key/value file. Any problem reading or parsing it yields an
/// empty map: suites must still run on built-in defaults.
pub fn load_properties_file(path: &Path) -> HashMap<String, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("Config file {} not loaded: {}", path.display(), e);
            return HashMap::new();
        }
    };

    let is_yaml = path
        .extension()
        .map_or(false, |ext| ext == "yaml" || ext == "yml");

    if is_yaml {
        parse_yaml(&content).unwrap_or_else(|e| {
            log::warn!("Ignoring unparsable config file {}: {}", path.display(), e);
            HashMap::new()
        })
    } else {
        parse_properties(&content)
    }
}

/// Parse Java-style `.properties` content (`key=value` or `key: value`).
pub fn parse_properties(content: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let split_at = line.find(|c| c == '=' || c == ':');
        let (key, value) = match split_at {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, ""),
        };

        let key = key.trim();
        if !key.is_empty() {
            props.insert(key.to_string(), value.trim().to_string());
        }
    }

    props
}

/// Parse a flat YAML mapping; scalar values are stringified, nested values skipped.
fn parse_yaml(content: &str) -> Result<HashMap<String, String>, serde_yaml::Error> {
    let raw: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(content)?;

    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| {
            let value = match v {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((k, value))
        })
        .collect())
}
