//! Reference extraction from resource definitions.
//!
//! Definitions are arbitrary JSON. Dependencies are found by walking the
//! tree and recognising the CloudFormation intrinsics that name another
//! resource:
//!
//! * `{"Ref": "Id"}`
//! * `{"Fn::GetAtt": ["Id", "Attr"]}` or `{"Fn::GetAtt": "Id.Attr"}`
//! * `{"Fn::Sub": "...${Id}...${Id.Attr}..."}` and the `[template, vars]` form
//!
//! Names starting with `AWS::` are pseudo-parameters and declared template
//! parameters are not resources; neither becomes a dependency.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub const REF: &str = "Ref";
pub const GET_ATT: &str = "Fn::GetAtt";
pub const SUB: &str = "Fn::Sub";
pub const DEPENDS_ON: &str = "DependsOn";

/// True for `AWS::Region`, `AWS::NoValue` and the like.
pub fn is_pseudo_parameter(name: &str) -> bool {
    name.starts_with("AWS::")
}

/// Collect every resource id referenced anywhere in `value`.
pub fn collect_references(value: &Value, parameters: &BTreeSet<String>) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    visit(value, parameters, &mut found);
    found
}

/// The explicit `DependsOn` list of a definition, string or array form.
pub fn explicit_dependencies(definition: &Value) -> BTreeSet<String> {
    match definition.get(DEPENDS_ON) {
        Some(Value::String(s)) => BTreeSet::from([s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Split the target of a `Fn::GetAtt` into `(id, attribute)`.
pub fn get_att_target(arg: &Value) -> Option<(String, String)> {
    match arg {
        Value::Array(parts) => {
            let id = parts.first()?.as_str()?;
            let attr = match parts.get(1) {
                Some(Value::String(a)) => a.clone(),
                _ => String::new(),
            };
            Some((id.to_string(), attr))
        }
        Value::String(dotted) => {
            let (id, attr) = dotted.split_once('.')?;
            Some((id.to_string(), attr.to_string()))
        }
        _ => None,
    }
}

/// One `${...}` placeholder of a `Fn::Sub` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubToken {
    Text(String),
    /// `${Name}` or `${Name.Attr}`; `attribute` is empty for the first form.
    Variable { name: String, attribute: String },
}

/// Tokenise a `Fn::Sub` template. `${!Literal}` becomes the text `${Literal}`.
pub fn parse_sub(template: &str) -> Vec<SubToken> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            text.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let inner = after[..end].trim();
        if let Some(literal) = inner.strip_prefix('!') {
            text.push_str("${");
            text.push_str(literal);
            text.push('}');
        } else {
            if !text.is_empty() {
                tokens.push(SubToken::Text(std::mem::take(&mut text)));
            }
            let (name, attribute) = match inner.split_once('.') {
                Some((n, a)) => (n.to_string(), a.to_string()),
                None => (inner.to_string(), String::new()),
            };
            tokens.push(SubToken::Variable { name, attribute });
        }
        rest = &after[end + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        tokens.push(SubToken::Text(text));
    }
    tokens
}

/// Split a `Fn::Sub` argument into its template string and variable map.
pub fn sub_parts(arg: &Value) -> Option<(&str, Option<&Map<String, Value>>)> {
    match arg {
        Value::String(s) => Some((s.as_str(), None)),
        Value::Array(parts) => {
            let template = parts.first()?.as_str()?;
            Some((template, parts.get(1).and_then(|v| v.as_object())))
        }
        _ => None,
    }
}

fn add_candidate(name: &str, parameters: &BTreeSet<String>, found: &mut BTreeSet<String>) {
    if !name.is_empty() && !is_pseudo_parameter(name) && !parameters.contains(name) {
        found.insert(name.to_string());
    }
}

fn visit(value: &Value, parameters: &BTreeSet<String>, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(target)) = map.get(REF) {
                    add_candidate(target, parameters, found);
                    return;
                }
                if let Some(arg) = map.get(GET_ATT) {
                    if let Some((id, _)) = get_att_target(arg) {
                        add_candidate(&id, parameters, found);
                    }
                    return;
                }
                if let Some(arg) = map.get(SUB) {
                    if let Some((template, vars)) = sub_parts(arg) {
                        for token in parse_sub(template) {
                            if let SubToken::Variable { name, .. } = token {
                                if vars.map_or(false, |v| v.contains_key(&name)) {
                                    continue;
                                }
                                add_candidate(&name, parameters, found);
                            }
                        }
                        if let Some(vars) = vars {
                            for v in vars.values() {
                                visit(v, parameters, found);
                            }
                        }
                    }
                    return;
                }
            }
            for v in map.values() {
                visit(v, parameters, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit(item, parameters, found);
            }
        }
        _ => {}
    }
}
