use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use super::object::Object;
use crate::fault::Fault;

/// Result of evaluating anything inside the worker.
pub type Outcome = Result<Value, Fault>;

/// Host function body. Receives the receiver (`this`) and the argument list.
pub type Callable = dyn Fn(&Value, Vec<Value>) -> Outcome + Send + Sync;

/// Runtime value inside the worker scope.
///
/// JSON `null` doubles as "undefined".
#[derive(Clone)]
pub enum Value {
    Data(serde_json::Value),
    /// Results of independently resolved lists whose elements are not all data.
    List(Vec<Value>),
    Object(Object),
    Function(Function),
    /// Explicit async marker; settled before any response frame is built.
    Deferred(Deferred),
}

impl Default for Value {
    fn default() -> Self {
        Self::undefined()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(data) => write!(f, "Data({data})"),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Object(object) => write!(f, "Object({} members)", object.len()),
            Self::Function(function) => write!(f, "Function({})", function.name()),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(data: serde_json::Value) -> Self {
        Self::Data(data)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Self::Object(object)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Self::Function(function)
    }
}

impl From<Deferred> for Value {
    fn from(deferred: Deferred) -> Self {
        Self::Deferred(deferred)
    }
}

impl Value {
    pub fn undefined() -> Self {
        Self::Data(serde_json::Value::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Data(serde_json::Value::Null))
    }

    /// Wrap a future as a deferred value.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Self::Deferred(Deferred::new(future))
    }

    /// Collapse resolved values into one: pure data stays data, anything
    /// else is kept as a list.
    pub fn list(items: Vec<Value>) -> Self {
        if items.iter().all(|item| matches!(item, Self::Data(_))) {
            let data = items
                .into_iter()
                .map(|item| match item {
                    Self::Data(data) => data,
                    _ => serde_json::Value::Null,
                })
                .collect();
            Self::Data(serde_json::Value::Array(data))
        } else {
            Self::List(items)
        }
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_data().and_then(serde_json::Value::as_str)
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Read a named member. Missing members read as undefined.
    pub fn get(&self, name: &str) -> Value {
        match self {
            Self::Object(object) => object.get(name),
            Self::Data(data) => Self::Data(data_member(data, name)),
            Self::List(items) => match name {
                "length" => Self::Data(items.len().into()),
                index => index
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default(),
            },
            Self::Function(function) => match name {
                "name" => Self::Data(function.name().into()),
                "length" => Self::Data(function.arity().unwrap_or(0).into()),
                _ => Self::undefined(),
            },
            Self::Deferred(_) => Self::undefined(),
        }
    }

    /// Assign a named member and return the assigned value.
    pub fn set(&self, name: &str, value: Value) -> Outcome {
        match self {
            Self::Object(object) => object.set(name, value),
            _ => Err(Fault::read_only(name)),
        }
    }

    /// Serialize for the wire. Fails on anything holding functions, unsettled
    /// deferreds, or cycles.
    pub fn to_wire(&self) -> Result<serde_json::Value, NotSerializable> {
        let mut visiting = Vec::new();
        self.encode(&mut visiting)
    }

    pub(crate) fn encode(
        &self,
        visiting: &mut Vec<usize>,
    ) -> Result<serde_json::Value, NotSerializable> {
        match self {
            Self::Data(data) => Ok(data.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.encode(visiting))
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Self::Object(object) => object.encode(visiting),
            Self::Function(function) => Err(NotSerializable::Function(function.name().to_string())),
            Self::Deferred(_) => Err(NotSerializable::Deferred),
        }
    }

    /// Shallow merge-copy: keeps only the top-level members that serialize.
    pub fn to_wire_shallow(&self) -> serde_json::Value {
        match self {
            Self::Data(data) => data.clone(),
            Self::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.to_wire().unwrap_or(serde_json::Value::Null))
                    .collect(),
            ),
            Self::Object(object) => serde_json::Value::Object(
                object
                    .entries()
                    .into_iter()
                    .filter_map(|(name, value)| value.to_wire().ok().map(|data| (name, data)))
                    .collect(),
            ),
            Self::Function(_) | Self::Deferred(_) => {
                serde_json::Value::Object(serde_json::Map::new())
            }
        }
    }
}

fn data_member(data: &serde_json::Value, name: &str) -> serde_json::Value {
    match data {
        serde_json::Value::Object(map) => map.get(name).cloned().unwrap_or_default(),
        serde_json::Value::Array(items) if name == "length" => items.len().into(),
        serde_json::Value::Array(items) => name
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or_default(),
        serde_json::Value::String(s) if name == "length" => s.chars().count().into(),
        _ => serde_json::Value::Null,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotSerializable {
    #[error("function {0} cannot be serialized")]
    Function(String),
    #[error("deferred value cannot be serialized before it settles")]
    Deferred,
    #[error("cyclic object cannot be serialized")]
    Cycle,
}

/// Invocable scope member.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    arity: Option<usize>,
    restricted: bool,
    callable: Arc<Callable>,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("restricted", &self.restricted)
            .finish()
    }
}

impl Function {
    pub fn new<F>(name: impl Into<Arc<str>>, callable: F) -> Self
    where
        F: Fn(&Value, Vec<Value>) -> Outcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity: None,
            restricted: false,
            callable: Arc::new(callable),
        }
    }

    /// Declared parameter count; shorter argument lists are padded with undefined.
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    /// Mark as never invocable through the protocol, whatever name it is reached by.
    pub fn restricted(mut self) -> Self {
        self.restricted = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn call(&self, receiver: &Value, mut arguments: Vec<Value>) -> Outcome {
        if let Some(arity) = self.arity
            && arguments.len() < arity
        {
            arguments.resize(arity, Value::undefined());
        }
        (self.callable)(receiver, arguments)
    }
}

/// Value that settles later. Cloning shares the same settlement.
#[derive(Clone)]
pub struct Deferred(Shared<BoxFuture<'static, Outcome>>);

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Self(future.boxed().shared())
    }

    /// Wait for the value, following deferreds that settle to other deferreds.
    pub async fn settle(self) -> Outcome {
        let mut current = self;
        loop {
            match current.0.await {
                Ok(Value::Deferred(next)) => current = next,
                settled => return settled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_of_data_collapses_to_array() {
        let value = Value::list(vec![json!(1).into(), json!("two").into()]);
        assert_eq!(value.as_data(), Some(&json!([1, "two"])));
    }

    #[test]
    fn list_with_function_stays_list() {
        let f = Function::new("noop", |_, _| Ok(Value::undefined()));
        let value = Value::list(vec![json!(1).into(), f.into()]);
        assert!(matches!(value, Value::List(ref items) if items.len() == 2));
        assert_eq!(value.get("length").as_data(), Some(&json!(2)));
        assert_eq!(value.get("0").as_data(), Some(&json!(1)));
    }

    #[test]
    fn data_navigation() {
        let data = Value::from(json!({"port": 8080, "tags": ["a", "b"], "name": "relay"}));
        assert_eq!(data.get("port").as_data(), Some(&json!(8080)));
        assert_eq!(data.get("tags").get("1").as_data(), Some(&json!("b")));
        assert_eq!(data.get("tags").get("length").as_data(), Some(&json!(2)));
        assert_eq!(data.get("name").get("length").as_data(), Some(&json!(5)));
        assert!(data.get("missing").is_undefined());
        assert!(data.get("port").get("anything").is_undefined());
    }

    #[test]
    fn data_is_read_only() {
        let data = Value::from(json!({"port": 8080}));
        let fault = data.set("port", json!(1).into()).unwrap_err();
        assert_eq!(fault.name(), "ReadOnly");
    }

    #[test]
    fn arity_pads_missing_arguments() {
        let f = Function::new("count", |_, args| Ok(json!(args.len()).into())).with_arity(3);
        let result = f.call(&Value::undefined(), vec![json!(1).into()]).unwrap();
        assert_eq!(result.as_data(), Some(&json!(3)));

        let extra = f
            .call(&Value::undefined(), vec![Value::from(json!(1)); 5])
            .unwrap();
        assert_eq!(extra.as_data(), Some(&json!(5)));
    }

    #[test]
    fn function_is_not_serializable() {
        let f = Function::new("noop", |_, _| Ok(Value::undefined()));
        assert_eq!(
            Value::from(f.clone()).to_wire(),
            Err(NotSerializable::Function("noop".to_string()))
        );
        assert_eq!(Value::from(f).to_wire_shallow(), json!({}));
    }

    #[tokio::test]
    async fn deferred_settles_through_chains() {
        let inner = Value::deferred(async { Ok::<_, Fault>(Value::from(json!("done"))) });
        let outer = Deferred::new(async move { Ok::<_, Fault>(inner) });
        let settled = outer.settle().await.unwrap();
        assert_eq!(settled.as_data(), Some(&json!("done")));
    }

    #[tokio::test]
    async fn deferred_failure_settles_as_fault() {
        let deferred = Deferred::new(async { Err::<Value, _>(Fault::application("nope")) });
        let fault = deferred.settle().await.unwrap_err();
        assert_eq!(fault.to_string(), "nope");
    }
}
