// src/template/mod.rs

//! Template rendering for `.sql.tmpl` files
//!
//! Schema and change files may be templates; they render in memory before
//! checksumming and execution, so what is hashed and what runs is always
//! the rendered SQL. The delimiters are `{%~ expression %}` for values,
//! `<% %>` for blocks, `<# #>` for comments. The context exposes the
//! active config's public fields (never password material), config-scoped
//! secrets, app-level secrets, and an allowlisted slice of the process
//! environment.

pub mod helpers;

use crate::error::{Error, Result};
use minijinja::syntax::SyntaxConfig;
use minijinja::Environment;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variables exposed to templates carry this prefix, which is
/// stripped: `NOORM_VAR_REGION=eu` renders as `env.REGION`.
const ENV_PREFIX: &str = "NOORM_VAR_";

/// Everything a render can see
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub config: Value,
    pub secrets: BTreeMap<String, String>,
    pub global_secrets: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

impl RenderContext {
    /// The allowlisted environment slice
    pub fn allowlisted_env() -> BTreeMap<String, String> {
        std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect()
    }
}

/// The template engine, one per project
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new(project_root: &Path) -> Result<Self> {
        let syntax = SyntaxConfig::builder()
            .block_delimiters("<%", "%>")
            .variable_delimiters("{%~", "%}")
            .comment_delimiters("<#", "#>")
            .build()
            .map_err(|e| Error::Template {
                path: "<engine>".to_string(),
                message: e.to_string(),
            })?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        helpers::register(&mut env, PathBuf::from(project_root));

        Ok(Self { env })
    }

    /// Whether a path needs rendering before execution
    pub fn is_template(path: &Path) -> bool {
        path.extension().map(|ext| ext == "tmpl").unwrap_or(false)
    }

    /// Render template source. Same input and context produce identical
    /// output, so checksums over the result are stable.
    pub fn render(&self, label: &str, source: &str, ctx: &RenderContext) -> Result<String> {
        let context = json!({
            "config": ctx.config,
            "secrets": ctx.secrets,
            "globalSecrets": ctx.global_secrets,
            "env": ctx.env,
        });

        self.env
            .render_str(source, minijinja::Value::from_serialize(&context))
            .map_err(|e| Error::Template {
                path: label.to_string(),
                message: e.to_string(),
            })
    }

    /// Read a file and render it when it is a template; plain files pass
    /// through byte-for-byte.
    pub fn render_path(&self, path: &Path, ctx: &RenderContext) -> Result<String> {
        let source = fs::read_to_string(path)?;
        if Self::is_template(path) {
            self.render(&path.display().to_string(), &source, ctx)
        } else {
            Ok(source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(Path::new(".")).unwrap()
    }

    fn context_with_config() -> RenderContext {
        RenderContext {
            config: json!({ "default_role": "member", "database": "appdb" }),
            secrets: BTreeMap::from([("api_key".to_string(), "s3cr3t".to_string())]),
            global_secrets: BTreeMap::from([("org".to_string(), "acme".to_string())]),
            env: BTreeMap::from([("REGION".to_string(), "eu".to_string())]),
        }
    }

    #[test]
    fn test_variable_delimiters() {
        let rendered = engine()
            .render(
                "t",
                "CREATE TABLE roles(name TEXT DEFAULT '{%~ config.default_role %}');",
                &context_with_config(),
            )
            .unwrap();
        assert_eq!(
            rendered,
            "CREATE TABLE roles(name TEXT DEFAULT 'member');"
        );
    }

    #[test]
    fn test_secrets_and_env_visible() {
        let ctx = context_with_config();
        assert_eq!(
            engine().render("t", "{%~ secrets.api_key %}", &ctx).unwrap(),
            "s3cr3t"
        );
        assert_eq!(
            engine()
                .render("t", "{%~ globalSecrets.org %}-{%~ env.REGION %}", &ctx)
                .unwrap(),
            "acme-eu"
        );
    }

    #[test]
    fn test_block_syntax() {
        let ctx = context_with_config();
        let rendered = engine()
            .render(
                "t",
                "<% if config.database == 'appdb' %>yes<% else %>no<% endif %>",
                &ctx,
            )
            .unwrap();
        assert_eq!(rendered, "yes");
    }

    #[test]
    fn test_comments_are_stripped() {
        let rendered = engine()
            .render("t", "a<# hidden #>b", &RenderContext::default())
            .unwrap();
        assert_eq!(rendered, "ab");
    }

    #[test]
    fn test_render_is_pure() {
        let ctx = context_with_config();
        let a = engine()
            .render("t", "{%~ sql_quote(config.default_role) %}", &ctx)
            .unwrap();
        let b = engine()
            .render("t", "{%~ sql_quote(config.default_role) %}", &ctx)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "'member'");
    }

    #[test]
    fn test_unknown_variable_errors() {
        let result = engine().render("t", "{%~ config.missing.deep %}", &RenderContext::default());
        assert!(matches!(result, Err(Error::Template { .. })));
    }

    #[test]
    fn test_is_template() {
        assert!(TemplateEngine::is_template(Path::new("a/b/001.sql.tmpl")));
        assert!(!TemplateEngine::is_template(Path::new("a/b/001.sql")));
    }

    #[test]
    fn test_render_path_passthrough_and_template() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain.sql");
        fs::write(&plain, "SELECT 1;").unwrap();
        let tmpl = dir.path().join("t.sql.tmpl");
        fs::write(&tmpl, "SELECT '{%~ config.database %}';").unwrap();

        let engine = TemplateEngine::new(dir.path()).unwrap();
        let ctx = context_with_config();
        assert_eq!(engine.render_path(&plain, &ctx).unwrap(), "SELECT 1;");
        assert_eq!(
            engine.render_path(&tmpl, &ctx).unwrap(),
            "SELECT 'appdb';"
        );
    }
}
