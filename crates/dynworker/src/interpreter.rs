//! Request interpreter - evaluates request chains against the worker scope.
//!
//! A message is a list of requests forming a navigation chain: each request is
//! evaluated against the result of the previous one, the first against the
//! root scope. Request shapes:
//!
//! - `"name"`: read `context[name]`
//! - `["name", value?, nestedValue?, nestedValueList?]`: read, or write when any
//!   of the trailing slots is present
//! - `{"function": name, "arguments" | "nestedArguments"}`: call `context[name]`
//! - `{"property": name, "value", "nestedValue", "nestedValueList"}`: tuple form
//!   spelled as a record
//!
//! JSON has no `undefined`, so `null` in any optional slot means absent. The
//! two nested slots are only taken when truthy: `0`, `""` and `false` there
//! leave the plain `value` in charge. A record naming neither a function nor
//! a property evaluates to undefined.
//! Nested values and arguments are themselves messages, each resolved
//! independently from the root.

use crate::fault::Fault;
use crate::scope::{Object, Outcome, Value};

/// Members that can never be invoked through the protocol.
pub const DENY_LIST: &[&str] = &["eval"];

/// Parsed form of one request, borrowing from the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    Read(&'a str),
    Property(PropertyRequest<'a>),
    Function(FunctionRequest<'a>),
    /// Record with neither a `function` nor a `property` name.
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRequest<'a> {
    pub name: &'a str,
    pub value: Option<&'a serde_json::Value>,
    pub nested_value: Option<&'a serde_json::Value>,
    pub nested_value_list: Option<&'a serde_json::Value>,
}

impl PropertyRequest<'_> {
    pub fn is_read(&self) -> bool {
        self.value.is_none() && self.nested_value.is_none() && self.nested_value_list.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRequest<'a> {
    pub name: &'a str,
    pub arguments: Option<&'a serde_json::Value>,
    pub nested_arguments: Option<&'a serde_json::Value>,
}

fn present(value: Option<&serde_json::Value>) -> Option<&serde_json::Value> {
    value.filter(|v| !v.is_null())
}

/// Nested slots count only when truthy.
fn nested(value: Option<&serde_json::Value>) -> Option<&serde_json::Value> {
    value.filter(|v| match v {
        serde_json::Value::Null | serde_json::Value::Bool(false) => false,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    })
}

impl<'a> Request<'a> {
    pub fn parse(request: &'a serde_json::Value) -> Result<Self, Fault> {
        match request {
            serde_json::Value::String(name) => Ok(Self::Read(name)),
            serde_json::Value::Array(items) => match items.first() {
                Some(serde_json::Value::String(name)) => Ok(Self::Property(PropertyRequest {
                    name,
                    value: present(items.get(1)),
                    nested_value: nested(items.get(2)),
                    nested_value_list: nested(items.get(3)),
                })),
                _ => Err(Fault::bad_request(request)),
            },
            serde_json::Value::Object(record) => {
                if let Some(serde_json::Value::String(name)) = record.get("function") {
                    Ok(Self::Function(FunctionRequest {
                        name,
                        arguments: present(record.get("arguments")),
                        nested_arguments: present(record.get("nestedArguments")),
                    }))
                } else if let Some(serde_json::Value::String(name)) = record.get("property") {
                    Ok(Self::Property(PropertyRequest {
                        name,
                        value: present(record.get("value")),
                        nested_value: nested(record.get("nestedValue")),
                        nested_value_list: nested(record.get("nestedValueList")),
                    }))
                } else {
                    Ok(Self::Unrecognized)
                }
            }
            _ => Err(Fault::bad_request(request)),
        }
    }

    /// Short label used in fault traces.
    pub fn label(&self) -> String {
        match self {
            Self::Read(name) => (*name).to_string(),
            Self::Property(property) if property.is_read() => property.name.to_string(),
            Self::Property(property) => format!("{} =", property.name),
            Self::Function(function) => format!("{}()", function.name),
            Self::Unrecognized => "{}".to_string(),
        }
    }
}

fn as_list(message: &serde_json::Value) -> &[serde_json::Value] {
    match message {
        serde_json::Value::Array(items) => items,
        single => std::slice::from_ref(single),
    }
}

/// Evaluates messages against a root scope.
#[derive(Debug, Clone)]
pub struct Interpreter {
    root: Object,
}

impl Interpreter {
    pub fn new(root: Object) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Object {
        &self.root
    }

    /// Fold a message left to right, starting from the root scope.
    pub fn process(&self, message: &serde_json::Value) -> Outcome {
        let mut result = Value::Object(self.root.clone());
        for request in as_list(message) {
            result = self.evaluate(request, &result)?;
        }
        Ok(result)
    }

    /// Resolve each element as its own message. Elements do not chain.
    pub fn process_multiple(&self, messages: &serde_json::Value) -> Result<Vec<Value>, Fault> {
        as_list(messages)
            .iter()
            .map(|message| self.process(message))
            .collect()
    }

    pub fn evaluate(&self, request: &serde_json::Value, context: &Value) -> Outcome {
        let parsed = Request::parse(request)?;
        let label = parsed.label();
        let outcome = match parsed {
            Request::Read(name) => Ok(context.get(name)),
            Request::Property(property) => self.apply_property(property, context),
            Request::Function(function) => self.call_function(function, context),
            Request::Unrecognized => {
                tracing::debug!(%request, "Record names neither a function nor a property");
                Ok(Value::undefined())
            }
        };
        outcome.map_err(|fault| fault.at(label))
    }

    fn call_function(&self, request: FunctionRequest<'_>, context: &Value) -> Outcome {
        let Value::Function(function) = context.get(request.name) else {
            return Err(Fault::function_not_found(request.name));
        };

        if DENY_LIST.contains(&request.name) || function.is_restricted() {
            tracing::warn!(function = request.name, "Rejected call to disallowed function");
            return Err(Fault::function_disallowed(request.name));
        }

        let arguments = match request.nested_arguments {
            Some(nested) => self.process_multiple(nested)?,
            None => match request.arguments {
                Some(serde_json::Value::Array(items)) => {
                    items.iter().cloned().map(Value::Data).collect()
                }
                Some(single) => vec![Value::Data(single.clone())],
                None => Vec::new(),
            },
        };

        function.call(context, arguments)
    }

    fn apply_property(&self, request: PropertyRequest<'_>, context: &Value) -> Outcome {
        if request.is_read() {
            return Ok(context.get(request.name));
        }

        let value = if let Some(list) = request.nested_value_list {
            Value::list(self.process_multiple(list)?)
        } else if let Some(nested) = request.nested_value {
            self.process(nested)?
        } else {
            request.value.cloned().map(Value::Data).unwrap_or_default()
        };

        context.set(request.name, value)
    }
}
