// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::{SourceDescriptor, SourceSpec};

pub const ENV_PATH: &str = "SOURCES_CONFIG_PATH";

/// Load a source list from an explicit path. Supports TOML (`[[sources]]`) or a JSON array.
pub fn load_sources_from(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_sources(&content, ext.as_str())
        .with_context(|| format!("parsing sources from {}", path.display()))
}

/// Load sources using env var + fallbacks:
/// 1) $SOURCES_CONFIG_PATH
/// 2) config/sources.toml
/// 3) config/sources.json
/// 4) built-in demo list
pub fn load_sources_default() -> Result<Vec<SourceDescriptor>> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_sources_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path {}", pb.display()));
        }
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_sources_from(&toml_p);
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_sources_from(&json_p);
    }
    tracing::info!("no source list found, using built-in defaults");
    default_sources()
}

fn parse_sources(s: &str, hint_ext: &str) -> Result<Vec<SourceDescriptor>> {
    let specs = if hint_ext == "toml" {
        parse_toml(s)?
    } else if hint_ext == "json" {
        parse_json(s)?
    } else {
        // No usable extension: JSON first, then TOML.
        match parse_json(s) {
            Ok(v) => v,
            Err(_) => parse_toml(s).map_err(|_| anyhow!("unsupported source list format"))?,
        }
    };
    validate(specs)
}

fn parse_toml(s: &str) -> Result<Vec<SourceSpec>> {
    #[derive(serde::Deserialize)]
    struct TomlSources {
        #[serde(default)]
        sources: Vec<SourceSpec>,
    }
    let v: TomlSources = toml::from_str(s)?;
    Ok(v.sources)
}

fn parse_json(s: &str) -> Result<Vec<SourceSpec>> {
    Ok(serde_json::from_str(s)?)
}

/// Every entry must validate; the error names the offending index.
pub fn validate(specs: Vec<SourceSpec>) -> Result<Vec<SourceDescriptor>> {
    specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| {
            let url = spec.url.clone();
            spec.build()
                .with_context(|| format!("source #{i} ({url}) is invalid"))
        })
        .collect()
}

const RICK_AND_MORTY_QUERY: &str = r#"query {
  characters(page: 1, filter: { name: "rick" }) {
    info { count }
    results { name status species }
  }
}"#;

/// Public demo endpoints used when nothing is configured.
pub fn default_sources() -> Result<Vec<SourceDescriptor>> {
    validate(vec![
        SourceSpec::rest("https://jsonplaceholder.typicode.com/posts").label("posts"),
        SourceSpec::rest("https://api.openbrewerydb.org/v1/breweries").label("breweries"),
        SourceSpec::graphql("https://rickandmortyapi.com/graphql", RICK_AND_MORTY_QUERY)
            .label("rick_and_morty_characters"),
        SourceSpec::graphql(
            "https://countries.trevorblades.com/graphql",
            "query { countries { name capital currency } }",
        )
        .label("countries"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::SourceKind;
    use std::time::Duration;

    #[test]
    fn toml_and_json_formats_work() {
        let toml = r#"
[[sources]]
url = "https://example.com/items"
api_type = "REST"
label = "items"
params = { page = "1" }

[[sources]]
url = "https://example.com/graphql"
kind = "graphql"
query = "{ things { id } }"
timeout = 5
"#;
        let out = parse_sources(toml, "toml").unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label, "items");
        assert_eq!(out[0].params.get("page").map(String::as_str), Some("1"));
        assert_eq!(out[1].kind, SourceKind::GraphQl);
        assert_eq!(out[1].label, "example.com");
        assert_eq!(out[1].table_name, "example_com");
        assert_eq!(out[1].timeout, Duration::from_secs(5));

        let json = r#"[{"url": "https://a.test/x", "api_type": "REST", "retry_attempts": 5}]"#;
        let out = parse_sources(json, "").unwrap();
        assert_eq!(out[0].retry_attempts, 5);
    }

    #[test]
    fn invalid_entry_is_reported_with_index() {
        let json = r#"[
            {"url": "https://a.test/x", "api_type": "REST"},
            {"url": "https://a.test/g", "api_type": "GraphQL"}
        ]"#;
        let err = parse_sources(json, "json").unwrap_err();
        assert!(format!("{err:#}").contains("source #1"), "{err:#}");
    }

    #[test]
    fn defaults_are_valid() {
        let d = default_sources().unwrap();
        let labels: Vec<_> = d.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["posts", "breweries", "rick_and_morty_characters", "countries"]
        );
        assert!(d[2].query.as_deref().unwrap_or_default().contains("characters"));
    }
}
