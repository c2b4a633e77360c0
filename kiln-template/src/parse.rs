use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::trace;

use crate::{Builder, ConfigMap, OnlyExcept, PostProcessor, Provisioner, Template, Variable};

impl Template {
    /// Parse and validate a template document from a reader.
    ///
    /// The document is a JSON object with optional top-level keys
    /// `builders`, `provisioners`, `post-processors`, and `variables`. Any
    /// structural problem (missing `type`, duplicate builder name,
    /// malformed post-processor shape) fails the whole parse; a partial
    /// template is never returned.
    pub fn parse(reader: impl Read) -> Result<Template> {
        let document: Value =
            serde_json::from_reader(reader).context("template is not valid JSON")?;

        let Value::Object(mut document) = document else {
            bail!("template must be a JSON object");
        };

        let mut template = Template::default();

        if let Some(builders) = document.shift_remove("builders") {
            template.builders = parse_builders(builders)?;
        }

        if let Some(provisioners) = document.shift_remove("provisioners") {
            let Value::Array(entries) = provisioners else {
                bail!("'provisioners' must be an array");
            };
            for (index, entry) in entries.into_iter().enumerate() {
                template.provisioners.push(parse_provisioner(index, entry)?);
            }
        }

        if let Some(chains) = document.shift_remove("post-processors") {
            let Value::Array(entries) = chains else {
                bail!("'post-processors' must be an array");
            };
            for (index, entry) in entries.into_iter().enumerate() {
                template
                    .post_processors
                    .push(parse_post_processor_chain(index, entry)?);
            }
        }

        if let Some(variables) = document.shift_remove("variables") {
            let Value::Object(entries) = variables else {
                bail!("'variables' must be an object");
            };
            for (name, value) in entries {
                let variable = parse_variable(&name, value)?;
                template.variables.insert(name, variable);
            }
        }

        trace!(
            builders = template.builders.len(),
            provisioners = template.provisioners.len(),
            post_processors = template.post_processors.len(),
            "parsed template",
        );
        Ok(template)
    }

    /// Parse a template from a file on disk.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Template> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open template: {}", path.display()))?;
        Self::parse(BufReader::new(file))
    }
}

/// Builders appear either as an array of objects (name defaulting to the
/// type) or as an object keyed by builder name. An explicit `name` field
/// wins in both shapes.
fn parse_builders(value: Value) -> Result<HashMap<String, Builder>> {
    let mut builders = HashMap::new();

    let mut insert = |name: String, r#type: String, config: ConfigMap| -> Result<()> {
        let builder = Builder {
            name: name.clone(),
            r#type,
            config,
        };
        if builders.insert(name.clone(), builder).is_some() {
            bail!("builder '{name}' is defined more than once");
        }
        Ok(())
    };

    match value {
        Value::Array(entries) => {
            for (index, entry) in entries.into_iter().enumerate() {
                let mut config = as_object(entry, &format!("builder {index}"))?;
                let r#type = take_type(&mut config, &format!("builder {index}"))?;
                let name = match take_string(&mut config, "name")? {
                    Some(name) => name,
                    None => r#type.clone(),
                };
                insert(name, r#type, config)?;
            }
        }
        Value::Object(entries) => {
            for (key, entry) in entries {
                let mut config = as_object(entry, &format!("builder '{key}'"))?;
                let r#type = take_type(&mut config, &format!("builder '{key}'"))?;
                let name = match take_string(&mut config, "name")? {
                    Some(name) => name,
                    None => key,
                };
                insert(name, r#type, config)?;
            }
        }
        _ => bail!("'builders' must be an array or an object"),
    }

    Ok(builders)
}

fn parse_provisioner(index: usize, value: Value) -> Result<Provisioner> {
    let mut config = as_object(value, &format!("provisioner {index}"))?;
    let r#type = take_type(&mut config, &format!("provisioner {index}"))?;

    let pause_before = match config.shift_remove("pause_before") {
        Some(Value::String(duration)) => Some(
            parse_duration(&duration)
                .with_context(|| format!("provisioner '{}': invalid 'pause_before'", r#type))?,
        ),
        Some(_) => bail!("provisioner '{}': 'pause_before' must be a duration string", r#type),
        None => None,
    };

    let only_except = OnlyExcept {
        only: take_string_list(&mut config, "only", &r#type)?,
        except: take_string_list(&mut config, "except", &r#type)?,
    };

    let r#override = match config.shift_remove("override") {
        Some(Value::Object(entries)) => {
            let mut overrides = HashMap::new();
            for (builder, fragment) in entries {
                let fragment = as_object(
                    fragment,
                    &format!("provisioner '{}' override for '{builder}'", r#type),
                )?;
                overrides.insert(builder, fragment);
            }
            overrides
        }
        Some(_) => bail!(
            "provisioner '{}': 'override' must map builder names to objects",
            r#type
        ),
        None => HashMap::new(),
    };

    Ok(Provisioner {
        r#type,
        pause_before,
        only_except,
        r#override,
        config,
    })
}

/// A post-processor chain is declared as a bare type string, a single config
/// object, or an array of either. All three normalize to a sequence of
/// [`PostProcessor`] entries.
fn parse_post_processor_chain(index: usize, value: Value) -> Result<Vec<PostProcessor>> {
    match value {
        Value::String(r#type) => Ok(vec![post_processor_of(index, r#type)?]),
        Value::Object(config) => Ok(vec![parse_post_processor(index, config)?]),
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| match entry {
                Value::String(r#type) => post_processor_of(index, r#type),
                Value::Object(config) => parse_post_processor(index, config),
                _ => bail!("post-processor {index}: chain entries must be strings or objects"),
            })
            .collect(),
        _ => bail!("post-processor {index}: must be a string, an object, or an array"),
    }
}

fn post_processor_of(index: usize, r#type: String) -> Result<PostProcessor> {
    if r#type.is_empty() {
        bail!("post-processor {index}: type must not be empty");
    }
    Ok(PostProcessor {
        r#type,
        ..Default::default()
    })
}

fn parse_post_processor(index: usize, mut config: ConfigMap) -> Result<PostProcessor> {
    let r#type = take_type(&mut config, &format!("post-processor {index}"))?;

    let keep_input_artifact = match config.shift_remove("keep_input_artifact") {
        Some(Value::Bool(keep)) => keep,
        Some(_) => bail!(
            "post-processor '{}': 'keep_input_artifact' must be a boolean",
            r#type
        ),
        None => false,
    };

    Ok(PostProcessor {
        r#type,
        keep_input_artifact,
        config,
    })
}

/// A variable is declared as a literal default value or as an object with
/// `default`/`required` keys. A literal `null` declares the variable with
/// no default.
fn parse_variable(name: &str, value: Value) -> Result<Variable> {
    match value {
        Value::Object(mut entries) => {
            let default = entries.shift_remove("default");
            let required = match entries.shift_remove("required") {
                Some(Value::Bool(required)) => required,
                Some(_) => bail!("variable '{name}': 'required' must be a boolean"),
                None => false,
            };
            Ok(Variable { default, required })
        }
        Value::Null => Ok(Variable::default()),
        literal => Ok(Variable {
            default: Some(literal),
            required: false,
        }),
    }
}

fn as_object(value: Value, what: &str) -> Result<ConfigMap> {
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{what}: must be an object"),
    }
}

/// Remove a string field from a config map. Present but non-string is an
/// error; absent is `None`.
fn take_string(config: &mut ConfigMap, key: &str) -> Result<Option<String>> {
    match config.shift_remove(key) {
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => bail!("'{key}' must be a string"),
        None => Ok(None),
    }
}

fn take_type(config: &mut ConfigMap, what: &str) -> Result<String> {
    match take_string(config, "type").with_context(|| what.to_string())? {
        Some(r#type) if !r#type.is_empty() => Ok(r#type),
        _ => bail!("{what}: missing required field 'type'"),
    }
}

fn take_string_list(config: &mut ConfigMap, key: &str, kind: &str) -> Result<Vec<String>> {
    match config.shift_remove(key) {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .map(|entry| match entry {
                Value::String(name) => Ok(name),
                _ => bail!("provisioner '{kind}': '{key}' must be an array of builder names"),
            })
            .collect(),
        Some(_) => bail!("provisioner '{kind}': '{key}' must be an array of builder names"),
        None => Ok(Vec::new()),
    }
}

/// Parse a duration string like "1s", "300ms", or "1h30m".
///
/// Supports the units ns, us (or µs), ms, s, m, and h, with integer or
/// fractional values, in any combination.
pub fn parse_duration(duration: &str) -> Result<Duration> {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    let segment =
        SEGMENT.get_or_init(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)(ns|us|µs|ms|s|m|h)").unwrap());

    let mut total = Duration::ZERO;
    let mut end = 0;

    for captures in segment.captures_iter(duration) {
        let matched = captures.get(0).unwrap();

        // Segments must be contiguous from the start of the string
        if matched.start() != end {
            break;
        }
        end = matched.end();

        let nanos: u64 = match &captures[2] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            _ => 3_600_000_000_000,
        };

        // Integer segments stay exact; fractional ones go through f64
        let value = &captures[1];
        total += if let Ok(count) = value.parse::<u64>() {
            count
                .checked_mul(nanos)
                .map(Duration::from_nanos)
                .ok_or_else(|| anyhow!("duration out of range: '{duration}'"))?
        } else {
            let count: f64 = value.parse()?;
            Duration::from_secs_f64(count * nanos as f64 / 1e9)
        };
    }

    if end == 0 || end != duration.len() {
        bail!("invalid duration: '{duration}'");
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn parse(document: &str) -> Result<Template> {
        Template::parse(document.as_bytes())
    }

    #[test]
    fn test_parse_basic_builder() {
        let template = parse(r#"{"builders": {"something": {"type": "something"}}}"#).unwrap();

        assert_eq!(template.builders.len(), 1);
        let builder = &template.builders["something"];
        assert_eq!(builder.name, "something");
        assert_eq!(builder.r#type, "something");
        assert!(builder.config.is_empty());
    }

    #[test]
    fn test_parse_builder_list() {
        let template =
            parse(r#"{"builders": [{"type": "qemu"}, {"type": "qemu", "name": "local"}]}"#)
                .unwrap();

        assert_eq!(template.builders.len(), 2);
        assert_eq!(template.builders["qemu"].r#type, "qemu");
        assert_eq!(template.builders["local"].r#type, "qemu");
    }

    #[test]
    fn test_parse_builder_shapes_agree() {
        let from_map = parse(r#"{"builders": {"qemu": {"type": "qemu"}}}"#).unwrap();
        let from_list = parse(r#"{"builders": [{"type": "qemu"}]}"#).unwrap();

        assert_eq!(from_map, from_list);
    }

    #[test]
    fn test_parse_builder_no_type() {
        assert!(parse(r#"{"builders": {"something": {}}}"#).is_err());
        assert!(parse(r#"{"builders": [{"name": "something"}]}"#).is_err());
        assert!(parse(r#"{"builders": [{"type": ""}]}"#).is_err());
    }

    #[test]
    fn test_parse_builder_repeat() {
        assert!(parse(r#"{"builders": [{"type": "qemu"}, {"type": "qemu"}]}"#).is_err());
        assert!(
            parse(
                r#"{"builders": {"a": {"type": "t", "name": "x"}, "b": {"type": "t", "name": "x"}}}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_parse_builder_passthrough_config() {
        let template =
            parse(r#"{"builders": [{"type": "qemu", "iso_url": "http://x", "memory": 4096}]}"#)
                .unwrap();

        let builder = &template.builders["qemu"];
        assert_eq!(builder.config["iso_url"], json!("http://x"));
        assert_eq!(builder.config["memory"], json!(4096));
        // recognized keys are lifted out of the pass-through config
        assert!(!builder.config.contains_key("type"));
    }

    #[test]
    fn test_parse_provisioner_basic() {
        let template = parse(r#"{"provisioners": [{"type": "something"}]}"#).unwrap();

        assert_eq!(template.provisioners.len(), 1);
        assert_eq!(template.provisioners[0].r#type, "something");
        assert_eq!(template.provisioners[0].pause_before, None);
    }

    #[test]
    fn test_parse_provisioner_pause_before() {
        let template =
            parse(r#"{"provisioners": [{"type": "something", "pause_before": "1s"}]}"#).unwrap();

        assert_eq!(
            template.provisioners[0].pause_before,
            Some(Duration::from_secs(1))
        );
        assert!(!template.provisioners[0].config.contains_key("pause_before"));
    }

    #[test]
    fn test_parse_provisioner_only_except() {
        let template =
            parse(r#"{"provisioners": [{"type": "something", "only": ["foo"]}]}"#).unwrap();
        assert_eq!(template.provisioners[0].only_except.only, vec!["foo"]);

        let template =
            parse(r#"{"provisioners": [{"type": "something", "except": ["foo"]}]}"#).unwrap();
        assert_eq!(template.provisioners[0].only_except.except, vec!["foo"]);
    }

    #[test]
    fn test_parse_provisioner_override() {
        let template =
            parse(r#"{"provisioners": [{"type": "something", "override": {"foo": {}}}]}"#)
                .unwrap();

        let provisioner = &template.provisioners[0];
        assert_eq!(provisioner.r#override.len(), 1);
        assert_eq!(provisioner.r#override["foo"], ConfigMap::new());
        assert!(!provisioner.config.contains_key("override"));
    }

    #[test]
    fn test_parse_provisioner_no_type() {
        assert!(parse(r#"{"provisioners": [{}]}"#).is_err());
    }

    #[test]
    fn test_parse_provisioner_order_preserved() {
        let template = parse(
            r#"{"provisioners": [{"type": "c"}, {"type": "a"}, {"type": "b"}]}"#,
        )
        .unwrap();

        let types: Vec<&str> = template
            .provisioners
            .iter()
            .map(|p| p.r#type.as_str())
            .collect();
        assert_eq!(types, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_parse_variable_default() {
        let template = parse(r#"{"variables": {"foo": "bar"}}"#).unwrap();

        assert_eq!(template.variables["foo"].default, Some(json!("bar")));
        assert!(!template.variables["foo"].required);
    }

    #[test]
    fn test_parse_variable_required() {
        let template = parse(r#"{"variables": {"foo": {"required": true}}}"#).unwrap();

        assert_eq!(template.variables["foo"].default, None);
        assert!(template.variables["foo"].required);
    }

    #[test]
    fn test_parse_variable_null() {
        let template = parse(r#"{"variables": {"foo": null}}"#).unwrap();

        assert_eq!(template.variables["foo"], Variable::default());
    }

    #[test]
    fn test_parse_pp_basic() {
        let template = parse(r#"{"post-processors": [{"type": "foo", "foo": "bar"}]}"#).unwrap();

        assert_eq!(template.post_processors.len(), 1);
        let chain = &template.post_processors[0];
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].r#type, "foo");
        assert_eq!(chain[0].config["foo"], json!("bar"));
    }

    #[test]
    fn test_parse_pp_keep() {
        let template =
            parse(r#"{"post-processors": [{"type": "foo", "keep_input_artifact": true}]}"#)
                .unwrap();

        let post_processor = &template.post_processors[0][0];
        assert!(post_processor.keep_input_artifact);
        assert!(post_processor.config.is_empty());
    }

    #[test]
    fn test_parse_pp_shape_invariant() {
        // A bare string, a single object, and a one-element array all
        // describe the same single-type chain
        let from_string = parse(r#"{"post-processors": ["foo"]}"#).unwrap();
        let from_map = parse(r#"{"post-processors": [{"type": "foo"}]}"#).unwrap();
        let from_array = parse(r#"{"post-processors": [[{"type": "foo"}]]}"#).unwrap();

        assert_eq!(from_string, from_map);
        assert_eq!(from_map, from_array);
        assert_eq!(
            from_string.post_processors,
            vec![vec![PostProcessor {
                r#type: "foo".into(),
                ..Default::default()
            }]]
        );
    }

    #[test]
    fn test_parse_pp_two_chains() {
        let template = parse(r#"{"post-processors": ["foo", "bar"]}"#).unwrap();

        assert_eq!(template.post_processors.len(), 2);
        assert_eq!(template.post_processors[0][0].r#type, "foo");
        assert_eq!(template.post_processors[1][0].r#type, "bar");
    }

    #[test]
    fn test_parse_pp_multi() {
        let template = parse(r#"{"post-processors": [["foo", {"type": "bar"}]]}"#).unwrap();

        assert_eq!(template.post_processors.len(), 1);
        let chain = &template.post_processors[0];
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].r#type, "foo");
        assert_eq!(chain[1].r#type, "bar");
    }

    #[test]
    fn test_parse_pp_no_type() {
        assert!(parse(r#"{"post-processors": [{}]}"#).is_err());
        assert!(parse(r#"{"post-processors": [["foo", {}]]}"#).is_err());
        assert!(parse(r#"{"post-processors": [42]}"#).is_err());
    }

    #[test]
    fn test_parse_empty_document() {
        let template = parse("{}").unwrap();
        assert_eq!(template, Template::default());
    }

    #[test]
    fn test_parse_not_an_object() {
        assert!(parse("[]").is_err());
        assert!(parse("not json").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(
            parse_duration("1.5h").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(parse_duration("2us").unwrap(), Duration::from_micros(2));
        assert_eq!(parse_duration("10m30s").unwrap(), Duration::from_secs(630));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1s junk").is_err());
    }
}
