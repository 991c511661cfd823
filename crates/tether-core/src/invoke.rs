//! Invocation envelopes: the two message shapes the engine exchanges.
//!
//! ```text
//! Call:   { "uid": 7, "listener": "nested.double", "parameters": [{ "type": "number", "value": 21 }] }
//! Return: { "uid": 7, "success": true, "value": 42 }
//! ```
//!
//! The union is untagged; an envelope carrying `listener` is a Call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One wire-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Invoke {
    Function(InvokeFunction),
    Return(InvokeReturn),
}

impl Invoke {
    pub fn uid(&self) -> u64 {
        match self {
            Invoke::Function(function) => function.uid,
            Invoke::Return(ret) => ret.uid,
        }
    }

    /// Whether this envelope carries a listener, i.e. is a Call.
    pub fn is_function(&self) -> bool {
        matches!(self, Invoke::Function(_))
    }
}

impl From<InvokeFunction> for Invoke {
    fn from(function: InvokeFunction) -> Self {
        Invoke::Function(function)
    }
}

impl From<InvokeReturn> for Invoke {
    fn from(ret: InvokeReturn) -> Self {
        Invoke::Return(ret)
    }
}

/// A request to run `listener` on the remote Provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeFunction {
    pub uid: u64,
    /// Dotted member path, e.g. `"nested.double"`.
    pub listener: String,
    pub parameters: Vec<InvokeParameter>,
}

impl InvokeFunction {
    pub fn new(uid: u64, listener: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            uid,
            listener: listener.into(),
            parameters: args.into_iter().map(InvokeParameter::from).collect(),
        }
    }

    /// The bare argument values, in order.
    pub fn arguments(&self) -> Vec<Value> {
        self.parameters.iter().map(|p| p.value.clone()).collect()
    }
}

/// One argument together with its runtime type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeParameter {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

impl From<Value> for InvokeParameter {
    fn from(value: Value) -> Self {
        Self {
            kind: type_tag(&value).to_string(),
            value,
        }
    }
}

/// The `typeof` name of a JSON value. Arrays and null report `object`.
pub fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

/// The outcome of a Call, matched back to it by `uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeReturn {
    pub uid: u64,
    pub success: bool,
    #[serde(default)]
    pub value: Value,
}

impl InvokeReturn {
    pub fn success(uid: u64, value: Value) -> Self {
        Self {
            uid,
            success: true,
            value,
        }
    }

    pub fn failure(uid: u64, value: Value) -> Self {
        Self {
            uid,
            success: false,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listener_presence_discriminates_call() {
        let call: Invoke = serde_json::from_value(json!({
            "uid": 3,
            "listener": "plus",
            "parameters": [{"type": "number", "value": 2}, {"type": "number", "value": 3}]
        }))
        .unwrap();
        assert!(call.is_function());
        assert_eq!(call.uid(), 3);

        let ret: Invoke =
            serde_json::from_value(json!({"uid": 3, "success": true, "value": 5})).unwrap();
        assert!(!ret.is_function());
        assert_eq!(ret, Invoke::Return(InvokeReturn::success(3, json!(5))));
    }

    #[test]
    fn test_return_without_value_defaults_to_null() {
        let ret: Invoke = serde_json::from_value(json!({"uid": 1, "success": true})).unwrap();
        assert_eq!(ret, Invoke::Return(InvokeReturn::success(1, Value::Null)));
    }

    #[test]
    fn test_parameters_carry_type_tags() {
        let function = InvokeFunction::new(
            1,
            "mixed",
            vec![json!(1.5), json!("a"), json!(true), json!(null), json!([1]), json!({})],
        );
        let tags: Vec<&str> = function.parameters.iter().map(|p| p.kind.as_str()).collect();
        assert_eq!(
            tags,
            vec!["number", "string", "boolean", "object", "object", "object"]
        );

        let encoded = serde_json::to_value(&function).unwrap();
        assert_eq!(encoded["parameters"][1], json!({"type": "string", "value": "a"}));
        assert_eq!(function.arguments()[0], json!(1.5));
    }

    #[test]
    fn test_envelope_survives_text_encoding() {
        let original = Invoke::from(InvokeFunction::new(9, "nested.double", vec![json!(21)]));
        let text = serde_json::to_string(&original).unwrap();
        let decoded: Invoke = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, original);
    }
}
