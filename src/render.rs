// src/render.rs

//! Boot-script template rendering.
//!
//! Templates are embedded at build time and rendered with `{{Name}}`
//! placeholder substitution. Dotted paths (`{{Profile.hostname}}`) descend
//! into nested JSON objects; unresolved placeholders render as empty strings
//! because machine profiles are free-form maps and a missing key is data,
//! not an error.

use crate::db::models::JsonMap;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

pub const TEMPLATE_IPXE: &str = "ipxe";
pub const TEMPLATE_KICKSTART: &str = "kickstart";
pub const TEMPLATE_UNATTEND: &str = "unattend.xml";

/// Renders the embedded boot-script templates.
#[derive(Clone)]
pub struct Engine {
    templates: HashMap<&'static str, &'static str>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(TEMPLATE_IPXE, include_str!("render/templates/ipxe.tmpl"));
        templates.insert(
            TEMPLATE_KICKSTART,
            include_str!("render/templates/kickstart.tmpl"),
        );
        templates.insert(
            TEMPLATE_UNATTEND,
            include_str!("render/templates/unattend.xml.tmpl"),
        );
        Self { templates }
    }

    /// Render the named template with the provided variables.
    pub fn render(&self, name: &str, vars: &JsonMap) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("template {name}")))?;
        Ok(substitute(template, vars))
    }
}

/// Replace every `{{path}}` with the value found at that dotted path.
fn substitute(template: &str, vars: &JsonMap) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&lookup(vars, path));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder, emit verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(vars: &JsonMap, path: &str) -> String {
    let mut current: Option<&Value> = None;
    for (i, segment) in path.split('.').enumerate() {
        current = match (i, &current) {
            (0, _) => vars.get(segment),
            (_, Some(Value::Object(map))) => map.get(segment),
            _ => None,
        };
        if current.is_none() {
            return String::new();
        }
    }

    match current {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
