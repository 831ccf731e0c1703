//! Template rendering for stack inputs.
//!
//! Stack inputs (role, parameters, tags) are tera templates rendered with a
//! context of `{Name, Var, File}` plus two functions: `file(path=...)` reads a
//! local file and `stack(name=...)` returns the referenced stack's data. Color
//! filters are registered for cosmetic output; their result is opaque to
//! value rendering.
//!
//! The `stack` function is backed by a caller-supplied lookup. During
//! discovery the lookup records requested names; during the final render it
//! resolves them from an already-verified snapshot map. Errors travel
//! through tera's normal error channel, and panics raised inside helper code
//! are trapped and converted into template errors.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex};

use colored::Colorize;
use tera::{Context, Tera, Value};

use crate::error::{Error, Result};
use crate::remote::StackData;

/// Resolver for `stack(name=...)` references.
pub type StackLookup = Arc<dyn Fn(&str) -> std::result::Result<Value, String> + Send + Sync>;

/// Render `content` with the given context. The `stack` function is only
/// available when a lookup is supplied.
pub fn render(content: &str, context: &Context, stack_lookup: Option<StackLookup>) -> Result<String> {
    let mut tera = Tera::default();
    register_color_filters(&mut tera);
    tera.register_function("file", file_fn);
    if let Some(lookup) = stack_lookup {
        tera.register_function("stack", move |args: &HashMap<String, Value>| {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| tera::Error::msg("stack: missing 'name' argument"))?;
            lookup(name).map_err(tera::Error::msg)
        });
    }

    let outcome =
        std::panic::catch_unwind(AssertUnwindSafe(|| tera.render_str(content, context)));
    match outcome {
        Ok(Ok(rendered)) => Ok(rendered),
        Ok(Err(err)) => Err(Error::template(describe(&err))),
        Err(panic) => Err(Error::template(format!(
            "template helper panicked: {}",
            panic_message(&panic)
        ))),
    }
}

/// Render `content` with a collecting `stack` function and return the set of
/// referenced stack names, in first-use order. Render errors are ignored
/// here; they resurface during the final render.
pub fn discover_stack_refs(content: &str, context: &Context) -> Vec<String> {
    let names = Arc::new(Mutex::new(Vec::new()));
    let collector: StackLookup = {
        let names = names.clone();
        Arc::new(move |name| {
            let mut names = names.lock().unwrap();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
            Ok(placeholder_stack())
        })
    };
    let _ = render(content, context, Some(collector));
    let collected = names.lock().unwrap().clone();
    collected
}

fn placeholder_stack() -> Value {
    serde_json::to_value(StackData::default()).unwrap_or(Value::Null)
}

fn describe(err: &tera::Error) -> String {
    let mut out = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(err) = source {
        out.push_str(": ");
        out.push_str(&err.to_string());
        source = err.source();
    }
    out
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `file(path=...)`: read a local file. The path must be relative, non-empty,
/// and not resolve to the current directory.
fn file_fn(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("file: missing 'path' argument"))?;
    if !is_valid_relative(path) {
        return Err(tera::Error::msg(format!(
            "invalid path '{path}', it is absolute or cannot be resolved"
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| tera::Error::msg(format!("cannot read file '{path}': {e}")))?;
    Ok(Value::String(content))
}

fn is_valid_relative(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let path = Path::new(path);
    if path.is_absolute() {
        return false;
    }
    // Lexical clean; the path must not collapse to the current directory.
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    !parts.is_empty()
}

fn register_color_filters(tera: &mut Tera) {
    let filters: [(&str, fn(&str) -> String); 16] = [
        ("black", |s| s.black().to_string()),
        ("blue", |s| s.blue().to_string()),
        ("cyan", |s| s.cyan().to_string()),
        ("green", |s| s.green().to_string()),
        ("magenta", |s| s.magenta().to_string()),
        ("red", |s| s.red().to_string()),
        ("white", |s| s.white().to_string()),
        ("yellow", |s| s.yellow().to_string()),
        ("hiblack", |s| s.bright_black().to_string()),
        ("hiblue", |s| s.bright_blue().to_string()),
        ("hicyan", |s| s.bright_cyan().to_string()),
        ("higreen", |s| s.bright_green().to_string()),
        ("himagenta", |s| s.bright_magenta().to_string()),
        ("hired", |s| s.bright_red().to_string()),
        ("hiwhite", |s| s.bright_white().to_string()),
        ("hiyellow", |s| s.bright_yellow().to_string()),
    ];
    for (name, apply) in filters {
        tera.register_filter(
            name,
            move |value: &Value, _args: &HashMap<String, Value>| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(Value::String(apply(&text)))
            },
        );
    }
}
