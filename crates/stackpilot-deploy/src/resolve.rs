//! Intrinsic resolution against already-provisioned resources.

use crate::error::{DeployError, DeployResult};
use crate::provisioner::ProvisionedResource;
use crate::refs::{get_att_target, parse_sub, sub_parts, SubToken, GET_ATT, REF, SUB};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stackpilot_aws::AwsRegion;
use std::collections::BTreeMap;

const JOIN: &str = "Fn::Join";
const NO_VALUE: &str = "AWS::NoValue";

/// Values that pseudo-parameters and template parameters resolve to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub region: String,
    pub account_id: String,
    pub stack_name: String,
    pub partition: String,
    pub url_suffix: String,
    /// Template parameter values; defaults are filled in by the caller.
    pub parameters: BTreeMap<String, Value>,
}

impl DeploymentContext {
    pub fn new(region: &AwsRegion, account_id: &str, stack_name: &str) -> Self {
        Self {
            region: region.name.clone(),
            account_id: account_id.to_string(),
            stack_name: stack_name.to_string(),
            partition: region.partition().to_string(),
            url_suffix: region.url_suffix().to_string(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: Value) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    fn pseudo(&self, name: &str) -> Option<&str> {
        match name {
            "AWS::Region" => Some(&self.region),
            "AWS::AccountId" => Some(&self.account_id),
            "AWS::StackName" => Some(&self.stack_name),
            "AWS::Partition" => Some(&self.partition),
            "AWS::URLSuffix" => Some(&self.url_suffix),
            _ => None,
        }
    }
}

/// Replace every intrinsic in `value` with its concrete value.
///
/// `Ref` gives a parameter value, a pseudo-parameter or a physical id.
/// `Fn::GetAtt` reads an attribute. `Fn::Sub` and `Fn::Join` build strings.
/// Object entries and array elements resolving to `AWS::NoValue` are dropped.
pub fn resolve(
    value: &Value,
    resources: &BTreeMap<String, ProvisionedResource>,
    ctx: &DeploymentContext,
) -> DeployResult<Value> {
    Ok(Resolver { resources, ctx }.value(value)?.unwrap_or(Value::Null))
}

struct Resolver<'a> {
    resources: &'a BTreeMap<String, ProvisionedResource>,
    ctx: &'a DeploymentContext,
}

impl Resolver<'_> {
    /// `None` means `AWS::NoValue`.
    fn value(&self, value: &Value) -> DeployResult<Option<Value>> {
        match value {
            Value::Object(map) if map.len() == 1 => {
                if let Some(intrinsic) = self.intrinsic(map)? {
                    return Ok(intrinsic);
                }
                self.object(map).map(Some)
            }
            Value::Object(map) => self.object(map).map(Some),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(v) = self.value(item)? {
                        out.push(v);
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            other => Ok(Some(other.clone())),
        }
    }

    fn object(&self, map: &Map<String, Value>) -> DeployResult<Value> {
        let mut out = Map::with_capacity(map.len());
        for (key, v) in map {
            if let Some(resolved) = self.value(v)? {
                out.insert(key.clone(), resolved);
            }
        }
        Ok(Value::Object(out))
    }

    /// `Some(..)` when `map` is an intrinsic this resolver handles.
    fn intrinsic(&self, map: &Map<String, Value>) -> DeployResult<Option<Option<Value>>> {
        if let Some(Value::String(target)) = map.get(REF) {
            if target == NO_VALUE {
                return Ok(Some(None));
            }
            return self.reference(target).map(|v| Some(Some(v)));
        }
        if let Some(arg) = map.get(GET_ATT) {
            let (id, attr) = get_att_target(arg)
                .ok_or_else(|| DeployError::template(format!("malformed {}: {}", GET_ATT, arg)))?;
            return self.attribute(&id, &attr).map(|v| Some(Some(v)));
        }
        if let Some(arg) = map.get(SUB) {
            return self.sub(arg).map(|s| Some(Some(Value::String(s))));
        }
        if let Some(arg) = map.get(JOIN) {
            return self.join(arg).map(|s| Some(Some(Value::String(s))));
        }
        Ok(None)
    }

    fn reference(&self, name: &str) -> DeployResult<Value> {
        if let Some(v) = self.ctx.pseudo(name) {
            return Ok(Value::String(v.to_string()));
        }
        if let Some(v) = self.ctx.parameters.get(name) {
            return Ok(v.clone());
        }
        match self.resources.get(name) {
            Some(r) => Ok(Value::String(r.physical_id.clone())),
            None => Err(DeployError::unresolved(
                name,
                format!("Ref to '{}' has no provisioned value", name),
            )),
        }
    }

    fn attribute(&self, id: &str, attr: &str) -> DeployResult<Value> {
        let resource = self.resources.get(id).ok_or_else(|| {
            DeployError::unresolved(id, format!("Fn::GetAtt on '{}' before it was provisioned", id))
        })?;
        resource.attribute(attr).cloned().ok_or_else(|| {
            DeployError::unresolved(
                id,
                format!("'{}' ({}) has no attribute '{}'", id, resource.resource_type, attr),
            )
        })
    }

    fn sub(&self, arg: &Value) -> DeployResult<String> {
        let (template, vars) = sub_parts(arg)
            .ok_or_else(|| DeployError::template(format!("malformed {}: {}", SUB, arg)))?;
        let mut locals = BTreeMap::new();
        if let Some(vars) = vars {
            for (name, v) in vars {
                let resolved = self.value(v)?.unwrap_or(Value::Null);
                locals.insert(name.as_str(), resolved);
            }
        }

        let mut out = String::new();
        for token in parse_sub(template) {
            match token {
                SubToken::Text(text) => out.push_str(&text),
                SubToken::Variable { name, attribute } => {
                    let value = match locals.get(name.as_str()) {
                        Some(v) => v.clone(),
                        None if attribute.is_empty() => self.reference(&name)?,
                        None => self.attribute(&name, &attribute)?,
                    };
                    out.push_str(&scalar_text(&value));
                }
            }
        }
        Ok(out)
    }

    fn join(&self, arg: &Value) -> DeployResult<String> {
        let malformed = || DeployError::template(format!("malformed {}: {}", JOIN, arg));
        let parts = arg.as_array().filter(|p| p.len() == 2).ok_or_else(malformed)?;
        let delimiter = parts[0].as_str().ok_or_else(malformed)?;
        let items = match self.value(&parts[1])? {
            Some(Value::Array(items)) => items,
            _ => return Err(malformed()),
        };
        Ok(items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join(delimiter))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn provisioned(id: &str, physical: &str, attrs: Value) -> (String, ProvisionedResource) {
        let attributes = attrs
            .as_object()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        (
            id.to_string(),
            ProvisionedResource {
                logical_id: id.to_string(),
                resource_type: "AWS::Test::Thing".into(),
                physical_id: physical.to_string(),
                attributes,
                properties: json!({}),
                dependencies: BTreeSet::new(),
            },
        )
    }

    fn fixtures() -> (BTreeMap<String, ProvisionedResource>, DeploymentContext) {
        let resources = BTreeMap::from([
            provisioned("Bucket", "my-bucket", json!({"Arn": "arn:aws:s3:::my-bucket"})),
            provisioned("Queue", "https://sqs/q", json!({"QueueName": "q", "Port": 443})),
        ]);
        let ctx = DeploymentContext::new(&AwsRegion::new("eu-west-1"), "123456789012", "demo")
            .with_parameter("Env", json!("prod"));
        (resources, ctx)
    }

    #[test]
    fn ref_and_get_att() {
        let (resources, ctx) = fixtures();
        let out = resolve(
            &json!({
                "Name": {"Ref": "Bucket"},
                "Arn": {"Fn::GetAtt": ["Bucket", "Arn"]},
                "QueueName": {"Fn::GetAtt": "Queue.QueueName"},
                "Env": {"Ref": "Env"},
                "Region": {"Ref": "AWS::Region"}
            }),
            &resources,
            &ctx,
        )
        .unwrap();
        assert_eq!(
            out,
            json!({
                "Name": "my-bucket",
                "Arn": "arn:aws:s3:::my-bucket",
                "QueueName": "q",
                "Env": "prod",
                "Region": "eu-west-1"
            })
        );
    }

    #[test]
    fn sub_interpolates_everything() {
        let (resources, ctx) = fixtures();
        let out = resolve(
            &json!({"Fn::Sub": [
                "arn:${AWS::Partition}:sqs:${AWS::Region}:${AWS::AccountId}:${Queue.QueueName}-${Env}-${Local}:${Queue.Port}/${!Literal}",
                {"Local": {"Ref": "Bucket"}}
            ]}),
            &resources,
            &ctx,
        )
        .unwrap();
        assert_eq!(
            out,
            json!("arn:aws:sqs:eu-west-1:123456789012:q-prod-my-bucket:443/${Literal}")
        );
    }

    #[test]
    fn join_and_no_value() {
        let (resources, ctx) = fixtures();
        let out = resolve(
            &json!({
                "Joined": {"Fn::Join": [".", [{"Ref": "AWS::StackName"}, {"Ref": "AWS::URLSuffix"}]]},
                "Dropped": {"Ref": "AWS::NoValue"},
                "List": ["a", {"Ref": "AWS::NoValue"}, "b"]
            }),
            &resources,
            &ctx,
        )
        .unwrap();
        assert_eq!(out, json!({"Joined": "demo.amazonaws.com", "List": ["a", "b"]}));
    }

    #[test]
    fn unresolved_references_fail_with_the_id() {
        let (resources, ctx) = fixtures();
        let err = resolve(&json!({"X": {"Ref": "Missing"}}), &resources, &ctx).unwrap_err();
        assert_eq!(err.resource_id.as_deref(), Some("Missing"));
        let err = resolve(&json!({"Fn::GetAtt": ["Bucket", "Nope"]}), &resources, &ctx).unwrap_err();
        assert!(err.message.contains("'Nope'"));
    }

    #[test]
    fn non_intrinsic_objects_pass_through() {
        let (resources, ctx) = fixtures();
        let value = json!({"Tags": [{"Key": "Ref", "Value": "x"}], "Ref": "Bucket", "Extra": 1});
        assert_eq!(resolve(&value, &resources, &ctx).unwrap(), value);
    }
}
