use minijinja::{Environment, context, value::Value};
use once_cell::sync::Lazy;

use rmoci::Reference;
use rmoci::error::{Error, Result};

use crate::config::SyncStep;

static ENV: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.add_function("env", |name: String| {
        std::env::var(&name).unwrap_or_default()
    });
    env.add_function("file", |name: String| -> Result<String, minijinja::Error> {
        std::fs::read_to_string(&name)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| {
                minijinja::Error::new(
                    minijinja::ErrorKind::InvalidOperation,
                    format!("reading {name}: {e}"),
                )
            })
    });
    env.add_function("time", |fmt: Option<String>| {
        chrono::Utc::now()
            .format(fmt.as_deref().unwrap_or("%Y-%m-%dT%H:%M:%SZ"))
            .to_string()
    });
    env.add_filter("json", |v: Value| {
        serde_json::to_string(&v).unwrap_or_default()
    });
    env.add_filter("split", |s: String, sep: String| -> Vec<String> {
        s.split(sep.as_str()).map(str::to_string).collect()
    });
    env
});

/// Expand a config template against `{ Ref, Sync, Step }`. Strings without
/// template markers pass through untouched, so plain names cost nothing.
pub fn expand(tpl: &str, r: Option<&Reference>, step: Option<&SyncStep>) -> Result<String> {
    if !tpl.contains("{{") && !tpl.contains("{%") {
        return Ok(tpl.to_string());
    }
    let ctx = context! {
        Ref => Value::from_serialize(&r),
        Sync => Value::from_serialize(&step),
        Step => Value::from_serialize(&step),
    };
    ENV.render_str(tpl, ctx)
        .map_err(|e| Error::Template(format!("{tpl}: {e}")))
}
