//! Rules and queries.
//!
//! Rule inputs and outputs arrive as loosely shaped mappings
//! (`matches`/`equals`, `data`/`error`). They are decoded here, once, into
//! typed variants so nothing past this point handles raw mappings.

use crate::error::RuleError;
use crate::value::{GenericValue, Payload};
use std::collections::BTreeMap;
use std::time::Duration;
use tonic::Code;

/// One incoming call, as seen by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Fully-qualified service name
    pub service: String,
    pub method: String,
    /// Decoded request message
    pub payload: Payload,
    /// Call headers after filtering; `None` when nothing survived
    pub headers: Option<BTreeMap<String, String>>,
}

/// How a rule compares its payload with the query payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadMatch {
    /// Payloads must be equal
    Equals(Payload),
    /// Every listed field must match; extra query fields are ignored
    Matches(Payload),
}

impl PayloadMatch {
    pub fn payload(&self) -> &Payload {
        match self {
            PayloadMatch::Equals(p) | PayloadMatch::Matches(p) => p,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, PayloadMatch::Equals(_))
    }
}

/// Input side of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleInput {
    pub payload: PayloadMatch,
    /// Headers that must be present with exactly these values
    pub headers: BTreeMap<String, String>,
}

impl Default for RuleInput {
    fn default() -> Self {
        Self {
            payload: PayloadMatch::Matches(Payload::new()),
            headers: BTreeMap::new(),
        }
    }
}

impl RuleInput {
    pub fn equals(payload: Payload) -> Self {
        Self {
            payload: PayloadMatch::Equals(payload),
            headers: BTreeMap::new(),
        }
    }

    pub fn matches(payload: Payload) -> Self {
        Self {
            payload: PayloadMatch::Matches(payload),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Decode `{matches: ...}`, `{equals: ...}` (each optionally with
    /// `headers`) or a bare payload, which means `matches`.
    pub fn from_value(value: GenericValue) -> Result<Self, RuleError> {
        let mut map = match value {
            GenericValue::Null => return Ok(Self::default()),
            GenericValue::Map(m) => m,
            other => {
                return Err(RuleError::InvalidInput(format!(
                    "expected a mapping, found {}",
                    other.kind_name()
                )))
            }
        };

        let matches = map.remove("matches");
        let equals = map.remove("equals");

        let payload = match (matches, equals) {
            (Some(_), Some(_)) => {
                return Err(RuleError::InvalidInput(
                    "both matches and equals given".to_string(),
                ))
            }
            (Some(m), None) => PayloadMatch::Matches(input_payload("matches", m)?),
            (None, Some(e)) => PayloadMatch::Equals(input_payload("equals", e)?),
            (None, None) => return Ok(Self::matches(map)),
        };

        let headers = match map.remove("headers") {
            Some(h) => header_map(h)?,
            None => BTreeMap::new(),
        };

        if let Some(key) = map.keys().next() {
            return Err(RuleError::InvalidInput(format!("unexpected key {key:?}")));
        }

        Ok(Self { payload, headers })
    }
}

fn input_payload(key: &str, value: GenericValue) -> Result<Payload, RuleError> {
    match value {
        GenericValue::Null => Ok(Payload::new()),
        GenericValue::Map(m) => Ok(m),
        other => Err(RuleError::InvalidInput(format!(
            "{key} must be a mapping, found {}",
            other.kind_name()
        ))),
    }
}

fn header_map(value: GenericValue) -> Result<BTreeMap<String, String>, RuleError> {
    let GenericValue::Map(entries) = value else {
        return Err(RuleError::InvalidInput(
            "headers must be a mapping".to_string(),
        ));
    };

    entries
        .into_iter()
        .map(|(name, v)| match v {
            GenericValue::String(s) => Ok((name, s)),
            other => Err(RuleError::InvalidInput(format!(
                "header {name} must be a string, found {}",
                other.kind_name()
            ))),
        })
        .collect()
}

/// Output side of a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutput {
    /// Respond with this payload
    Data {
        payload: Payload,
        /// Render string leaves as templates against the request
        template: bool,
        /// Wait before responding
        delay: Option<Duration>,
    },
    /// Fail the call with this status
    Error { message: String, code: Code },
}

impl Default for RuleOutput {
    fn default() -> Self {
        Self::data(Payload::new())
    }
}

impl RuleOutput {
    pub fn data(payload: Payload) -> Self {
        RuleOutput::Data {
            payload,
            template: false,
            delay: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RuleOutput::Error {
            message: message.into(),
            code: Code::Internal,
        }
    }

    /// Decode `{data: ..., template?, delay_ms?}`, `{error: "...", code?}`
    /// or a bare payload, which means `data`.
    pub fn from_value(value: GenericValue) -> Result<Self, RuleError> {
        let mut map = match value {
            GenericValue::Null => return Ok(Self::default()),
            GenericValue::Map(m) => m,
            other => {
                return Err(RuleError::InvalidOutput(format!(
                    "expected a mapping, found {}",
                    other.kind_name()
                )))
            }
        };

        let data = map.remove("data");
        let error = map.remove("error");

        let output = match (data, error) {
            (Some(_), Some(_)) => {
                return Err(RuleError::InvalidOutput(
                    "both data and error given".to_string(),
                ))
            }
            (None, None) => return Ok(Self::data(map)),
            (None, Some(error)) => {
                let message = match error {
                    GenericValue::String(message) => message,
                    other => {
                        return Err(RuleError::InvalidOutput(format!(
                            "error must be a string, found {}",
                            other.kind_name()
                        )))
                    }
                };
                let code = match map.remove("code") {
                    None | Some(GenericValue::Null) => Code::Internal,
                    Some(c) => status_code(&c)?,
                };
                RuleOutput::Error { message, code }
            }
            (Some(data), None) => {
                let payload = match data {
                    GenericValue::Null => Payload::new(),
                    GenericValue::Map(m) => m,
                    other => {
                        return Err(RuleError::InvalidOutput(format!(
                            "data must be a mapping, found {}",
                            other.kind_name()
                        )))
                    }
                };
                let template = match map.remove("template") {
                    None | Some(GenericValue::Null) => false,
                    Some(GenericValue::Bool(b)) => b,
                    Some(other) => {
                        return Err(RuleError::InvalidOutput(format!(
                            "template must be a bool, found {}",
                            other.kind_name()
                        )))
                    }
                };
                let delay = match map.remove("delay_ms") {
                    None | Some(GenericValue::Null) => None,
                    Some(ms) => match ms.as_i128().and_then(|n| u64::try_from(n).ok()) {
                        Some(ms) => Some(Duration::from_millis(ms)),
                        None => {
                            return Err(RuleError::InvalidOutput(
                                "delay_ms must be a non-negative integer".to_string(),
                            ))
                        }
                    },
                };
                RuleOutput::Data {
                    payload,
                    template,
                    delay,
                }
            }
        };

        if let Some(key) = map.keys().next() {
            return Err(RuleError::InvalidOutput(format!("unexpected key {key:?}")));
        }

        Ok(output)
    }
}

fn status_code(value: &GenericValue) -> Result<Code, RuleError> {
    value
        .as_i128()
        .and_then(|n| i32::try_from(n).ok())
        // 0 is OK, which cannot fail a call
        .filter(|n| (1..=16).contains(n))
        .map(Code::from_i32)
        .ok_or_else(|| RuleError::InvalidOutput(format!("invalid status code {value:?}")))
}

/// A stored input criterion paired with a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub service: String,
    pub method: String,
    pub input: RuleInput,
    pub output: RuleOutput,
}

impl Rule {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        input: RuleInput,
        output: RuleOutput,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            input,
            output,
        }
    }

    /// Build a rule from raw mappings, decoding input and output.
    pub fn from_values(
        service: impl Into<String>,
        method: impl Into<String>,
        input: GenericValue,
        output: GenericValue,
    ) -> Result<Self, RuleError> {
        Ok(Self::new(
            service,
            method,
            RuleInput::from_value(input)?,
            RuleOutput::from_value(output)?,
        ))
    }
}
