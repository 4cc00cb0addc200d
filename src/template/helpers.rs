// src/template/helpers.rs

//! Built-in template helpers
//!
//! SQL quoting, volatile value generators, and data-file loaders rooted at
//! the project directory. Loader paths must stay inside the project;
//! absolute paths and parent traversal are rejected.

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind};
use std::path::{Component, Path, PathBuf};

/// Escape a string for inclusion inside a SQL string literal
pub fn sql_escape(input: &str) -> String {
    input.replace('\'', "''")
}

/// Escape and wrap a string as a SQL string literal
pub fn sql_quote(input: &str) -> String {
    format!("'{}'", sql_escape(input))
}

fn loader_error(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

/// Resolve a loader path under the project root
fn resolve(root: &Path, rel: &str) -> Result<PathBuf, Error> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(loader_error(format!("absolute path not allowed: {}", rel)));
    }
    if rel_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(loader_error(format!("parent traversal not allowed: {}", rel)));
    }
    Ok(root.join(rel_path))
}

fn read_file(root: &Path, rel: &str) -> Result<String, Error> {
    let path = resolve(root, rel)?;
    std::fs::read_to_string(&path)
        .map_err(|e| loader_error(format!("cannot read {}: {}", path.display(), e)))
}

/// Register every built-in helper on the environment
pub fn register(env: &mut Environment<'_>, project_root: PathBuf) {
    env.add_function("sql_escape", |s: String| sql_escape(&s));
    env.add_function("sql_quote", |s: String| sql_quote(&s));
    env.add_function("uuid", || uuid::Uuid::new_v4().to_string());
    env.add_function("iso_now", || chrono::Utc::now().to_rfc3339());

    let root = project_root.clone();
    env.add_function("load_json", move |rel: String| -> Result<Value, Error> {
        let text = read_file(&root, &rel)?;
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| loader_error(format!("invalid JSON in {}: {}", rel, e)))?;
        Ok(Value::from_serialize(&parsed))
    });

    let root = project_root.clone();
    env.add_function("load_json5", move |rel: String| -> Result<Value, Error> {
        let text = read_file(&root, &rel)?;
        let parsed: serde_json::Value = json5::from_str(&text)
            .map_err(|e| loader_error(format!("invalid JSON5 in {}: {}", rel, e)))?;
        Ok(Value::from_serialize(&parsed))
    });

    let root = project_root.clone();
    env.add_function("load_yaml", move |rel: String| -> Result<Value, Error> {
        let text = read_file(&root, &rel)?;
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text)
            .map_err(|e| loader_error(format!("invalid YAML in {}: {}", rel, e)))?;
        Ok(Value::from_serialize(&parsed))
    });

    let root = project_root.clone();
    env.add_function("load_csv", move |rel: String| -> Result<Value, Error> {
        let text = read_file(&root, &rel)?;
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| loader_error(format!("invalid CSV in {}: {}", rel, e)))?
            .clone();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| loader_error(format!("invalid CSV in {}: {}", rel, e)))?;
            let mut row = serde_json::Map::new();
            for (header, field) in headers.iter().zip(record.iter()) {
                row.insert(
                    header.to_string(),
                    serde_json::Value::String(field.to_string()),
                );
            }
            rows.push(serde_json::Value::Object(row));
        }
        Ok(Value::from_serialize(&rows))
    });

    let root = project_root;
    env.add_function("load_sql", move |rel: String| -> Result<String, Error> {
        read_file(&root, &rel)
    });
}
