use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub const PROBLEM_CATALOG_SCHEMA: &str = "problem_catalog_v1.jsonschema";
pub const SESSION_REPORT_SCHEMA: &str = "session_report_v1.jsonschema";

pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect();
    names.sort();
    names
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: allow newly added schema files before this crate is rebuilt.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| anyhow!("schema {} does not compile: {}", name, e))?;
    Ok(compiled)
}

/// Validates `value` against the named schema, joining every violation into one error.
pub fn validate_value(name: &str, value: &Value) -> Result<()> {
    let compiled = compile_schema(name)?;
    if let Err(errors) = compiled.validate(value) {
        let msgs: Vec<String> = errors
            .map(|e| format!("{} at '{}'", e, e.instance_path))
            .collect();
        return Err(anyhow!(
            "{} validation failed: {}",
            name,
            msgs.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_are_listed_and_compile() {
        let names = schema_names();
        assert!(names.contains(&PROBLEM_CATALOG_SCHEMA.to_string()));
        assert!(names.contains(&SESSION_REPORT_SCHEMA.to_string()));
        for name in names {
            compile_schema(&name).expect("schema should compile");
        }
    }

    #[test]
    fn catalog_schema_accepts_minimal_catalog() {
        let catalog = json!({
            "schema_version": "problem_catalog_v1",
            "problems": [{
                "id": "noop_hotel",
                "namespace": "hotel",
                "faulty_service": [],
                "app": {"name": "hotel", "deploy": ["true"]},
                "fault": {"inject": ["true"], "recover": ["true"]}
            }]
        });
        validate_value(PROBLEM_CATALOG_SCHEMA, &catalog).expect("valid catalog");
    }

    #[test]
    fn catalog_schema_rejects_empty_argv() {
        let catalog = json!({
            "schema_version": "problem_catalog_v1",
            "problems": [{
                "id": "broken",
                "namespace": "hotel",
                "faulty_service": ["geo"],
                "app": {"name": "hotel", "deploy": []},
                "fault": {"inject": ["true"], "recover": ["true"]}
            }]
        });
        let err = validate_value(PROBLEM_CATALOG_SCHEMA, &catalog).expect_err("must fail");
        assert!(err.to_string().contains(PROBLEM_CATALOG_SCHEMA));
    }

    #[test]
    fn report_schema_rejects_unknown_outcome() {
        let report = json!({
            "schema_version": "session_report_v1",
            "session_id": "s",
            "problem_id": "p",
            "outcome": "exploded",
            "started_at": "2026-01-01T00:00:00Z",
            "finished_at": "2026-01-01T00:00:01Z",
            "results": {},
            "elapsed_seconds": 1.0,
            "framework_overhead": 1.0,
            "results_digest": "sha256:00"
        });
        assert!(validate_value(SESSION_REPORT_SCHEMA, &report).is_err());
    }

    #[test]
    fn unknown_schema_is_an_error() {
        assert!(load_schema("missing.jsonschema").is_err());
    }
}
