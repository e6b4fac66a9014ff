use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::proto;

/// Typed value of a function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::String(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Executable content and typed parameters assigned to a node at admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub content: Vec<u8>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl FunctionSpec {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn parameters_to_proto(&self) -> Vec<proto::Parameter> {
        self.parameters.iter().map(proto::Parameter::from).collect()
    }

    /// Rebuild a spec from a registration response.
    pub fn from_registration(
        response: proto::NodeRegistrationResponse,
    ) -> Result<Self, DispatchError> {
        let parameters = response
            .parameters
            .into_iter()
            .map(Parameter::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            content: response.content,
            parameters,
        })
    }
}

impl From<&Parameter> for proto::Parameter {
    fn from(param: &Parameter) -> Self {
        use proto::parameter::Value;

        let value = match &param.value {
            ParameterValue::Bool(v) => Value::BoolValue(*v),
            ParameterValue::Int(v) => Value::IntValue(*v),
            ParameterValue::Float(v) => Value::FloatValue(*v),
            ParameterValue::String(v) => Value::StringValue(v.clone()),
        };

        proto::Parameter {
            name: param.name.clone(),
            value: Some(value),
        }
    }
}

impl TryFrom<proto::Parameter> for Parameter {
    type Error = DispatchError;

    fn try_from(param: proto::Parameter) -> Result<Self, Self::Error> {
        use proto::parameter::Value;

        let value = match param.value {
            Some(Value::BoolValue(v)) => ParameterValue::Bool(v),
            Some(Value::IntValue(v)) => ParameterValue::Int(v),
            Some(Value::FloatValue(v)) => ParameterValue::Float(v),
            Some(Value::StringValue(v)) => ParameterValue::String(v),
            None => {
                return Err(DispatchError::InvalidParameter(format!(
                    "parameter {} has no value",
                    param.name
                )))
            }
        };

        Ok(Parameter {
            name: param.name,
            value,
        })
    }
}
