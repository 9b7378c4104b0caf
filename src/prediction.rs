use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;
use validator::Validate;

use crate::store::model::NewPrediction;

/// Raw create payload. Every field stays untyped until [`NewPrediction::try_from`] coerces it,
/// an explicit `null` counts as absent.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrediction {
    /// Non-empty after trimming, at most 100 characters
    #[schema(value_type = String, example = "Rain")]
    name: Option<Value>,
    /// Number or numeric string in 0..=100
    #[schema(value_type = f64, example = 73)]
    percent: Option<Value>,
    /// Truthy values count as true, defaults to false
    #[schema(value_type = Option<bool>)]
    will_go: Option<Value>,
    #[schema(value_type = Option<String>, example = "☔")]
    emoji: Option<Value>,
    #[schema(value_type = Option<String>)]
    title: Option<Value>,
    #[schema(value_type = Option<String>)]
    message: Option<Value>,
    /// Truthy values count as true, defaults to false
    #[schema(value_type = Option<bool>)]
    special: Option<Value>,
}

/// Caller data that violates a constraint, carrying the offending field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {0}")]
pub struct InvalidInput(pub &'static str);

impl CreatePrediction {
    /// Anything other than a JSON object is rejected outright
    pub fn from_body(body: Value) -> Result<CreatePrediction, InvalidInput> {
        if !body.is_object() {
            return Err(InvalidInput("body"));
        }
        serde_json::from_value(body).map_err(|_| InvalidInput("body"))
    }
}

impl TryFrom<CreatePrediction> for NewPrediction {
    type Error = InvalidInput;

    fn try_from(value: CreatePrediction) -> Result<Self, Self::Error> {
        let name = match value.name {
            Some(Value::String(name)) => name
                .trim_matches(|c: char| c.is_whitespace() || c == BOM)
                .to_owned(),
            _ => return Err(InvalidInput("name")),
        };

        let prediction = NewPrediction {
            name,
            // NaN fails validation below, so a bad name is still reported first
            percent: number(value.percent.as_ref()).unwrap_or(f64::NAN),
            will_go: truthy(value.will_go.as_ref()),
            emoji: text("emoji", value.emoji)?,
            title: text("title", value.title)?,
            message: text("message", value.message)?,
            special: truthy(value.special.as_ref()),
        };

        prediction.validate().map_err(|errors| {
            let fields = errors.field_errors();
            let field = ["name", "percent"]
                .into_iter()
                .find(|field| fields.contains_key(*field))
                .unwrap_or("body");
            InvalidInput(field)
        })?;
        Ok(prediction)
    }
}

/// Byte order mark, stripped along with whitespace
const BOM: char = '\u{feff}';

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

fn text(field: &'static str, value: Option<Value>) -> Result<String, InvalidInput> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::Array(_) | Value::Object(_)) => Err(InvalidInput(field)),
    }
}

/// Page size for the list endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(u32);

impl Limit {
    pub const DEFAULT: u32 = 50;
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 200;

    /// Numeric input is clamped into `MIN..=MAX`, anything unparsable falls back to `DEFAULT`
    pub fn parse(raw: Option<&str>) -> Limit {
        let value = raw
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|n| !n.is_nan());

        match value {
            Some(n) => Limit(n.clamp(f64::from(Self::MIN), f64::from(Self::MAX)) as u32),
            None => Limit(Self::DEFAULT),
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}
