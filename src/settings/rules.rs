// src/settings/rules.rs

//! Rule evaluation and stage enforcement
//!
//! Rules are ordered; each contributes include/exclude path prefixes when
//! its matcher accepts the config. Effects concatenate in rule order onto
//! the base build lists, and an excluded prefix always overrides any
//! include of the same path.

use crate::error::{Error, Result};
use crate::settings::model::{Rule, Settings};
use crate::state::model::Config;
use glob::Pattern;
use std::path::Path;

/// Final include/exclude prefix lists for one config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildPaths {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl BuildPaths {
    /// Whether a schema-relative path survives the lists.
    ///
    /// Empty include list means "everything"; exclusion wins over any
    /// include.
    pub fn allows(&self, rel_path: &Path) -> bool {
        if self.exclude.iter().any(|prefix| has_prefix(rel_path, prefix)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|prefix| has_prefix(rel_path, prefix))
    }
}

fn has_prefix(rel_path: &Path, prefix: &str) -> bool {
    rel_path.starts_with(Path::new(prefix))
}

fn rule_matches(rule: &Rule, name: &str, config: &Config) -> bool {
    let m = &rule.matcher;
    if let Some(dialect) = &m.dialect {
        if dialect != config.dialect.as_str() {
            return false;
        }
    }
    if let Some(is_test) = m.is_test {
        if is_test != config.is_test {
            return false;
        }
    }
    if let Some(protected) = m.protected {
        if protected != config.protected {
            return false;
        }
    }
    if let Some(stage) = &m.stage {
        if config.stage.as_deref() != Some(stage.as_str()) {
            return false;
        }
    }
    if let Some(name_glob) = &m.name_glob {
        match Pattern::new(name_glob) {
            Ok(pattern) => {
                if !pattern.matches(name) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

/// Resolve the effective build lists for one config: base lists plus the
/// effects of every matching rule, in order.
pub fn effective_build_paths(settings: &Settings, name: &str, config: &Config) -> BuildPaths {
    let mut paths = match &settings.build {
        Some(build) => BuildPaths {
            include: build.include.clone(),
            exclude: build.exclude.clone(),
        },
        None => BuildPaths::default(),
    };

    for rule in &settings.rules {
        if rule_matches(rule, name, config) {
            paths.include.extend(rule.effect.include.iter().cloned());
            paths.exclude.extend(rule.effect.exclude.iter().cloned());
        }
    }

    paths
}

/// Validate a config against its stage's constraint template.
///
/// A stage default of `protected: true` forbids linked configs from being
/// unprotected; `isTest` works the same way in both directions.
pub fn enforce_stage(settings: &Settings, name: &str, config: &Config) -> Result<()> {
    let Some(stage_name) = &config.stage else {
        return Ok(());
    };
    let Some(stage) = settings.stages.get(stage_name) else {
        return Err(Error::StageConstraint {
            stage: stage_name.clone(),
            config: name.to_string(),
            reason: "stage is not defined in settings".to_string(),
        });
    };
    let Some(defaults) = &stage.defaults else {
        return Ok(());
    };

    if defaults.protected == Some(true) && !config.protected {
        return Err(Error::StageConstraint {
            stage: stage_name.clone(),
            config: name.to_string(),
            reason: "stage requires protected=true".to_string(),
        });
    }
    if let Some(is_test) = defaults.is_test {
        if is_test != config.is_test {
            return Err(Error::StageConstraint {
                stage: stage_name.clone(),
                config: name.to_string(),
                reason: format!("stage requires isTest={}", is_test),
            });
        }
    }
    Ok(())
}

/// Secret keys the config's stage demands but the given key set lacks
pub fn missing_stage_secrets(
    settings: &Settings,
    config: &Config,
    available: &[String],
) -> Vec<String> {
    let Some(stage_name) = &config.stage else {
        return Vec::new();
    };
    let Some(stage) = settings.stages.get(stage_name) else {
        return Vec::new();
    };
    stage
        .secrets
        .iter()
        .filter(|key| !available.contains(key))
        .cloned()
        .collect()
}

/// Whether deleting this config is allowed. Configs linked to a locked
/// stage stay.
pub fn can_delete_config(settings: &Settings, name: &str, config: &Config) -> Result<()> {
    if let Some(stage_name) = &config.stage {
        if let Some(stage) = settings.stages.get(stage_name) {
            if stage.locked {
                return Err(Error::StageConstraint {
                    stage: stage_name.clone(),
                    config: name.to_string(),
                    reason: "stage is locked; unlink the config first".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::adapter::Dialect;
    use crate::settings::model::{BuildSettings, RuleEffect, RuleMatch, Stage, StageDefaults};

    fn base_settings() -> Settings {
        Settings {
            schema_version: 1,
            build: Some(BuildSettings {
                include: vec!["tables".to_string()],
                exclude: vec!["scratch".to_string()],
            }),
            ..Default::default()
        }
    }

    fn test_config() -> Config {
        let mut config = Config::new(Dialect::Postgres, "appdb");
        config.is_test = true;
        config
    }

    #[test]
    fn test_effects_concatenate_in_rule_order() {
        let mut settings = base_settings();
        settings.rules = vec![
            Rule {
                matcher: RuleMatch {
                    is_test: Some(true),
                    ..Default::default()
                },
                effect: RuleEffect {
                    include: vec!["fixtures".to_string()],
                    exclude: vec![],
                },
            },
            Rule {
                matcher: RuleMatch {
                    dialect: Some("postgres".to_string()),
                    ..Default::default()
                },
                effect: RuleEffect {
                    include: vec!["pg".to_string()],
                    exclude: vec!["mysql-only".to_string()],
                },
            },
        ];

        let paths = effective_build_paths(&settings, "dev", &test_config());
        assert_eq!(paths.include, vec!["tables", "fixtures", "pg"]);
        assert_eq!(paths.exclude, vec!["scratch", "mysql-only"]);
    }

    #[test]
    fn test_non_matching_rules_are_skipped() {
        let mut settings = base_settings();
        settings.rules = vec![Rule {
            matcher: RuleMatch {
                stage: Some("prod".to_string()),
                ..Default::default()
            },
            effect: RuleEffect {
                include: vec!["prod-only".to_string()],
                exclude: vec![],
            },
        }];

        let paths = effective_build_paths(&settings, "dev", &test_config());
        assert_eq!(paths.include, vec!["tables"]);
    }

    #[test]
    fn test_name_glob_matching() {
        let mut settings = base_settings();
        settings.rules = vec![Rule {
            matcher: RuleMatch {
                name_glob: Some("ci-*".to_string()),
                ..Default::default()
            },
            effect: RuleEffect {
                include: vec!["ci".to_string()],
                exclude: vec![],
            },
        }];

        let matched = effective_build_paths(&settings, "ci-main", &test_config());
        assert!(matched.include.contains(&"ci".to_string()));

        let unmatched = effective_build_paths(&settings, "dev", &test_config());
        assert!(!unmatched.include.contains(&"ci".to_string()));
    }

    #[test]
    fn test_exclude_overrides_include() {
        let paths = BuildPaths {
            include: vec!["tables".to_string()],
            exclude: vec!["tables/internal".to_string()],
        };
        assert!(paths.allows(Path::new("tables/users.sql")));
        assert!(!paths.allows(Path::new("tables/internal/audit.sql")));
    }

    #[test]
    fn test_empty_include_means_everything() {
        let paths = BuildPaths {
            include: vec![],
            exclude: vec!["scratch".to_string()],
        };
        assert!(paths.allows(Path::new("views/report.sql")));
        assert!(!paths.allows(Path::new("scratch/tmp.sql")));
    }

    #[test]
    fn test_protected_stage_rejects_unprotected_config() {
        let mut settings = base_settings();
        settings.stages.insert(
            "prod".to_string(),
            Stage {
                defaults: Some(StageDefaults {
                    protected: Some(true),
                    is_test: None,
                }),
                ..Default::default()
            },
        );

        let mut config = Config::new(Dialect::Postgres, "proddb");
        config.stage = Some("prod".to_string());

        let err = enforce_stage(&settings, "prod-main", &config).unwrap_err();
        assert!(matches!(err, Error::StageConstraint { .. }));

        config.protected = true;
        assert!(enforce_stage(&settings, "prod-main", &config).is_ok());
    }

    #[test]
    fn test_locked_stage_blocks_delete() {
        let mut settings = base_settings();
        settings.stages.insert(
            "prod".to_string(),
            Stage {
                locked: true,
                ..Default::default()
            },
        );

        let mut config = Config::new(Dialect::Postgres, "proddb");
        config.stage = Some("prod".to_string());

        assert!(can_delete_config(&settings, "prod-main", &config).is_err());

        config.stage = None;
        assert!(can_delete_config(&settings, "prod-main", &config).is_ok());
    }

    #[test]
    fn test_missing_stage_secrets() {
        let mut settings = base_settings();
        settings.stages.insert(
            "prod".to_string(),
            Stage {
                secrets: vec!["api_key".to_string(), "dsn".to_string()],
                ..Default::default()
            },
        );

        let mut config = Config::new(Dialect::Postgres, "proddb");
        config.stage = Some("prod".to_string());

        let missing = missing_stage_secrets(&settings, &config, &["api_key".to_string()]);
        assert_eq!(missing, vec!["dsn"]);

        let missing = missing_stage_secrets(
            &settings,
            &config,
            &["api_key".to_string(), "dsn".to_string()],
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let settings = base_settings();
        let mut config = Config::new(Dialect::Postgres, "appdb");
        config.stage = Some("ghost".to_string());

        assert!(enforce_stage(&settings, "dev", &config).is_err());
    }
}
