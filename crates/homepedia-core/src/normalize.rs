//! Pure conversions from raw source field shapes to canonical values.
//!
//! Every function here is idempotent: feeding a canonical value back in
//! returns it unchanged.

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Non-fatal problem found while normalizing one field. The field becomes null.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationWarning {
    #[error("could not parse {raw:?} as a number")]
    Unparseable { raw: String },
    #[error("value {value} is negative or not finite")]
    OutOfRange { value: f64 },
    #[error("unsupported json shape: {shape}")]
    UnsupportedShape { shape: &'static str },
}

/// Parses a French-formatted amount such as `"250 000 €"` or `"3 500,50 €/m²"`.
///
/// Empty input is `Ok(None)`.
pub fn parse_localized_decimal(raw: &str) -> Result<Option<f64>, NormalizationWarning> {
    let cleaned: String = raw
        .replace("/m²", "")
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '€' | '$' | '£'))
        .map(|c| if c == ',' { '.' } else { c })
        .collect();

    if cleaned.is_empty() {
        return Ok(None);
    }

    let value: f64 = cleaned
        .parse()
        .map_err(|_| NormalizationWarning::Unparseable {
            raw: raw.to_string(),
        })?;
    check_range(value).map(Some)
}

/// Normalizes a JSON amount. Lists reduce to their mean, with nulls counted as 0.
pub fn normalize_amount(value: &JsonValue) -> Result<Option<f64>, NormalizationWarning> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => {
            let v = n
                .as_f64()
                .ok_or(NormalizationWarning::UnsupportedShape { shape: "number" })?;
            check_range(v).map(Some)
        }
        JsonValue::String(s) => parse_localized_decimal(s),
        JsonValue::Array(items) => {
            if items.is_empty() {
                return Ok(Some(0.0));
            }
            let mut sum = 0.0;
            for item in items {
                match item {
                    JsonValue::Array(_) => {
                        return Err(NormalizationWarning::UnsupportedShape {
                            shape: "nested array",
                        })
                    }
                    other => sum += normalize_amount(other)?.unwrap_or(0.0),
                }
            }
            check_range(sum / items.len() as f64).map(Some)
        }
        JsonValue::Bool(_) => Err(NormalizationWarning::UnsupportedShape { shape: "bool" }),
        JsonValue::Object(_) => Err(NormalizationWarning::UnsupportedShape { shape: "object" }),
    }
}

/// Same as [`normalize_amount`], rounded to the nearest integer.
pub fn normalize_count(value: &JsonValue) -> Result<Option<i32>, NormalizationWarning> {
    normalize_amount(value)?.map(round_count).transpose()
}

pub fn round_count(value: f64) -> Result<i32, NormalizationWarning> {
    let rounded = value.round();
    if !(0.0..=i32::MAX as f64).contains(&rounded) {
        return Err(NormalizationWarning::OutOfRange { value });
    }
    Ok(rounded as i32)
}

/// `floor(price / surface)`, or 0 when the surface is unknown.
pub fn derive_price_per_m2(price: f64, surface_m2: f64) -> f64 {
    if surface_m2 > 0.0 && price.is_finite() && surface_m2.is_finite() {
        (price / surface_m2).floor()
    } else {
        0.0
    }
}

fn check_range(value: f64) -> Result<f64, NormalizationWarning> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(NormalizationWarning::OutOfRange { value })
    }
}
