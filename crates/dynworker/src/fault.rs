//! Worker-side failures.
//!
//! A [`Fault`] never escapes the worker's message loop: the responder turns it
//! into a response frame tagged `isError`.

/// What went wrong while evaluating a request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FaultKind {
    /// Request shape not recognised.
    #[error("bad request: {request}")]
    BadRequest { request: serde_json::Value },

    #[error("function {name} does not exist")]
    FunctionNotFound { name: String },

    /// Deny-listed member; the call never executes.
    #[error("function {name} cannot be executed")]
    FunctionDisallowed { name: String },

    #[error("property {name} is read-only")]
    ReadOnly { name: String },

    /// Host code panicked while handling the message.
    #[error("worker code panicked: {message}")]
    Panicked { message: String },

    /// Raised by host functions.
    #[error("{message}")]
    Application {
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl FaultKind {
    /// Name carried on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BadRequest",
            Self::FunctionNotFound { .. } => "FunctionNotFound",
            Self::FunctionDisallowed { .. } => "FunctionDisallowed",
            Self::ReadOnly { .. } => "ReadOnly",
            Self::Panicked { .. } => "Panicked",
            Self::Application { .. } => "Error",
        }
    }
}

/// A [`FaultKind`] plus the evaluation steps it unwound through, innermost first.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct Fault {
    kind: FaultKind,
    trace: Vec<String>,
}

impl From<FaultKind> for Fault {
    fn from(kind: FaultKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }
}

impl Fault {
    pub fn bad_request(request: &serde_json::Value) -> Self {
        FaultKind::BadRequest {
            request: request.clone(),
        }
        .into()
    }

    pub fn function_not_found(name: impl Into<String>) -> Self {
        FaultKind::FunctionNotFound { name: name.into() }.into()
    }

    pub fn function_disallowed(name: impl Into<String>) -> Self {
        FaultKind::FunctionDisallowed { name: name.into() }.into()
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        FaultKind::ReadOnly { name: name.into() }.into()
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        FaultKind::Panicked {
            message: message.into(),
        }
        .into()
    }

    pub fn application(message: impl Into<String>) -> Self {
        FaultKind::Application {
            message: message.into(),
            data: None,
        }
        .into()
    }

    pub fn application_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        FaultKind::Application {
            message: message.into(),
            data: Some(data),
        }
        .into()
    }

    pub fn kind(&self) -> &FaultKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Record the evaluation step this fault unwound through.
    pub(crate) fn at(mut self, step: impl Into<String>) -> Self {
        self.trace.push(step.into());
        self
    }

    pub fn stack(&self) -> String {
        let mut stack = format!("{}: {}", self.name(), self.kind);
        for step in &self.trace {
            stack.push_str("\n    at ");
            stack.push_str(step);
        }
        stack
    }

    /// Wire form: `{name, message, stack}` plus kind-specific details.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        payload.insert("name".to_string(), self.name().into());
        payload.insert("message".to_string(), self.kind.to_string().into());
        payload.insert("stack".to_string(), self.stack().into());
        match &self.kind {
            FaultKind::BadRequest { request } => {
                payload.insert("request".to_string(), request.clone());
            }
            FaultKind::FunctionNotFound { name }
            | FaultKind::FunctionDisallowed { name }
            | FaultKind::ReadOnly { name } => {
                payload.insert("member".to_string(), name.as_str().into());
            }
            FaultKind::Application {
                data: Some(data), ..
            } => {
                payload.insert("data".to_string(), data.clone());
            }
            FaultKind::Panicked { .. } | FaultKind::Application { data: None, .. } => {}
        }
        serde_json::Value::Object(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fault_display() {
        assert_eq!(
            Fault::function_not_found("open").to_string(),
            "function open does not exist"
        );
        assert_eq!(
            Fault::function_disallowed("eval").to_string(),
            "function eval cannot be executed"
        );
        assert_eq!(
            Fault::bad_request(&json!(42)).to_string(),
            "bad request: 42"
        );
        assert_eq!(Fault::application("boom").to_string(), "boom");
    }

    #[test]
    fn stack_lists_steps_innermost_first() {
        let fault = Fault::function_not_found("missing")
            .at("missing()")
            .at("console");
        assert_eq!(
            fault.stack(),
            "FunctionNotFound: function missing does not exist\n    at missing()\n    at console"
        );
    }

    #[test]
    fn wire_form_carries_details() {
        let fault = Fault::application_with("quota exceeded", json!({"limit": 3})).at("store()");
        insta::assert_json_snapshot!(fault.to_wire(), @r#"
        {
          "data": {
            "limit": 3
          },
          "message": "quota exceeded",
          "name": "Error",
          "stack": "Error: quota exceeded\n    at store()"
        }
        "#);
    }

    #[test]
    fn wire_form_names_member() {
        let wire = Fault::read_only("self").to_wire();
        assert_eq!(wire["name"], "ReadOnly");
        assert_eq!(wire["member"], "self");
    }
}
