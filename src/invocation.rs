//! Runtime values handed from woven code to advice, and the message
//! templates rendered from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A JVM value as seen by advice. Objects carry their class, an identity
/// hash and their `toString()` text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Value {
    Null,
    Boolean { value: bool },
    Int { value: i64 },
    Double { value: f64 },
    String { value: String },
    Object {
        class_name: String,
        identity: u64,
        text: String,
    },
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::String {
            value: value.into(),
        }
    }

    pub fn int(value: i64) -> Self {
        Value::Int { value }
    }

    pub fn object(class_name: &str, identity: u64, text: impl Into<String>) -> Self {
        Value::Object {
            class_name: class_name.to_string(),
            identity,
            text: text.into(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean { value } => write!(f, "{value}"),
            Value::Int { value } => write!(f, "{value}"),
            Value::Double { value } => write!(f, "{value}"),
            Value::String { value } => f.write_str(value),
            Value::Object { text, .. } => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throwable {
    pub class_name: String,
    pub message: Option<String>,
}

impl Throwable {
    pub fn new(class_name: &str, message: Option<&str>) -> Self {
        Self {
            class_name: class_name.to_string(),
            message: message.map(str::to_string),
        }
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {m}", self.class_name),
            None => f.write_str(&self.class_name),
        }
    }
}

/// Everything a before-handler may bind.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub receiver: Value,
    pub method_name: String,
    /// Java name of the declaring class.
    pub class_name: String,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(class_name: &str, method_name: &str) -> Self {
        Self {
            receiver: Value::Null,
            method_name: method_name.to_string(),
            class_name: class_name.to_string(),
            args: Vec::new(),
        }
    }

    pub fn receiver(mut self, receiver: Value) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    This,
    MethodName,
    ClassName,
    Arg(usize),
    ReturnValue,
}

/// `{{this}}`, `{{methodName}}`, `{{className}}`, `{{N}}` and `{{_}}`
/// placeholders; anything else between braces is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageTemplate {
    parts: Vec<Part>,
}

impl MessageTemplate {
    pub fn parse(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            let Some(close) = rest[open + 2..].find("}}") else {
                break;
            };
            text.push_str(&rest[..open]);
            let key = rest[open + 2..open + 2 + close].trim();
            let part = match key {
                "this" => Some(Part::This),
                "methodName" => Some(Part::MethodName),
                "className" => Some(Part::ClassName),
                "_" => Some(Part::ReturnValue),
                n => n.parse::<usize>().ok().map(Part::Arg),
            };
            match part {
                Some(part) => {
                    if !text.is_empty() {
                        parts.push(Part::Text(std::mem::take(&mut text)));
                    }
                    parts.push(part);
                }
                None => text.push_str(&rest[open..open + 2 + close + 2]),
            }
            rest = &rest[open + 2 + close + 2..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }
        Self { parts }
    }

    pub fn uses_receiver(&self) -> bool {
        self.parts.contains(&Part::This)
    }

    pub fn uses_method_name(&self) -> bool {
        self.parts.contains(&Part::MethodName)
    }

    pub fn uses_class_name(&self) -> bool {
        self.parts.contains(&Part::ClassName)
    }

    pub fn uses_args(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Arg(_)))
    }

    pub fn uses_return_value(&self) -> bool {
        self.parts.contains(&Part::ReturnValue)
    }

    /// Missing arguments and a missing return value render as empty text.
    pub fn render(&self, invocation: &Invocation, return_value: Option<&Value>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::This => out.push_str(&invocation.receiver.to_string()),
                Part::MethodName => out.push_str(&invocation.method_name),
                Part::ClassName => out.push_str(&invocation.class_name),
                Part::Arg(i) => {
                    if let Some(v) = invocation.args.get(*i) {
                        out.push_str(&v.to_string());
                    }
                }
                Part::ReturnValue => {
                    if let Some(v) = return_value {
                        out.push_str(&v.to_string());
                    }
                }
            }
        }
        out
    }
}
