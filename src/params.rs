//! Normalisation and validation of generation parameters.
//!
//! Both wire channels carry the same loosely typed parameter object. It is
//! turned into [`ValidatedParameters`] here, before any session logic runs,
//! so the rest of the crate only ever sees a [`LengthConstraint`] sum type
//! and a resolved [`Sampling`] mode.

use serde::{Deserialize, Deserializer, de};
use thiserror::Error;

use crate::config::GenerationDefaults;

/// Upper bound on the number of tokens a request may commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthConstraint {
    /// Total tokens, prefix included.
    MaxLength(usize),
    /// Newly generated tokens only.
    MaxNewTokens(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampling {
    Greedy,
    Sample {
        temperature: f64,
        top_k: usize,
        top_p: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParameters {
    pub model: Option<String>,
    pub sampling: Sampling,
    pub length: Option<LengthConstraint>,
}

/// Whether a message must carry a length constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRequirement {
    Required,
    Optional,
}

/// Parameters as they arrive on the wire. Numeric fields are signed so that
/// out-of-range values are reported as validation errors with the offending
/// field named, instead of as opaque decode failures.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawParameters {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub do_sample: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_length: Option<i64>,
    #[serde(default)]
    pub max_new_tokens: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error(
        "max_length and max_new_tokens are mutually exclusive, got max_length = {max_length} and max_new_tokens = {max_new_tokens}"
    )]
    ConflictingLength { max_length: i64, max_new_tokens: i64 },
    #[error("one of max_length or max_new_tokens is required")]
    MissingLength,
    #[error("{field} must be greater than 0, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("{field} = {value} exceeds the maximum of {ceiling}")]
    AboveCeiling {
        field: &'static str,
        value: i64,
        ceiling: usize,
    },
    #[error("temperature must be a finite number greater than 0, got {0}")]
    Temperature(f64),
    #[error("top_k must be greater than or equal to 0, got {0}")]
    TopK(i64),
    #[error("top_p must be in (0, 1], got {0}")]
    TopP(f64),
    #[error("unknown model {requested:?}, available models: {available}")]
    UnknownModel { requested: String, available: String },
    #[error("session is bound to model {session:?}, request asked for {requested:?}")]
    ModelMismatch { session: String, requested: String },
    #[error("inputs are required when there is no generated context to continue")]
    MissingInputs,
    #[error("prefix of {prefix_tokens} tokens leaves no room under max_length = {max_length}")]
    PrefixTooLong {
        prefix_tokens: usize,
        max_length: usize,
    },
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Validates `raw` against the process-wide `defaults`. Pure.
pub fn validate(
    raw: &RawParameters,
    requirement: LengthRequirement,
    defaults: &GenerationDefaults,
) -> Result<ValidatedParameters, ValidationError> {
    let length = validate_length(raw, requirement, defaults.max_length_ceiling)?;
    let sampling = if raw.do_sample.unwrap_or(false) {
        validate_sampling(raw, defaults)?
    } else {
        // Greedy decoding: sampling knobs are inert.
        Sampling::Greedy
    };

    Ok(ValidatedParameters {
        model: raw.model.clone(),
        sampling,
        length,
    })
}

fn validate_length(
    raw: &RawParameters,
    requirement: LengthRequirement,
    ceiling: usize,
) -> Result<Option<LengthConstraint>, ValidationError> {
    match (raw.max_length, raw.max_new_tokens) {
        (Some(max_length), Some(max_new_tokens)) => Err(ValidationError::ConflictingLength {
            max_length,
            max_new_tokens,
        }),
        (Some(value), None) => {
            check_length("max_length", value, ceiling).map(|n| Some(LengthConstraint::MaxLength(n)))
        }
        (None, Some(value)) => check_length("max_new_tokens", value, ceiling)
            .map(|n| Some(LengthConstraint::MaxNewTokens(n))),
        (None, None) => match requirement {
            LengthRequirement::Required => Err(ValidationError::MissingLength),
            LengthRequirement::Optional => Ok(None),
        },
    }
}

fn check_length(field: &'static str, value: i64, ceiling: usize) -> Result<usize, ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NonPositive { field, value });
    }
    match usize::try_from(value) {
        Ok(n) if n <= ceiling => Ok(n),
        _ => Err(ValidationError::AboveCeiling {
            field,
            value,
            ceiling,
        }),
    }
}

fn validate_sampling(
    raw: &RawParameters,
    defaults: &GenerationDefaults,
) -> Result<Sampling, ValidationError> {
    let temperature = raw.temperature.unwrap_or(defaults.temperature);
    if !temperature.is_finite() || temperature <= 0.0 {
        return Err(ValidationError::Temperature(temperature));
    }

    let top_k = match raw.top_k {
        Some(k) if k < 0 => return Err(ValidationError::TopK(k)),
        Some(k) => usize::try_from(k).map_err(|_| ValidationError::TopK(k))?,
        None => defaults.top_k,
    };

    let top_p = raw.top_p.unwrap_or(defaults.top_p);
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(ValidationError::TopP(top_p));
    }

    Ok(Sampling::Sample {
        temperature,
        top_k,
        top_p,
    })
}

/// `do_sample` is declared as a string by some clients (`"0"` / `"1"`), as a
/// boolean by others.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(value)) => Ok(Some(value)),
        Some(Flag::Int(0)) => Ok(Some(false)),
        Some(Flag::Int(1)) => Ok(Some(true)),
        Some(Flag::Int(other)) => Err(de::Error::custom(format!(
            "do_sample must be 0 or 1, got {other}"
        ))),
        Some(Flag::Text(text)) => match text.trim().to_lowercase().as_str() {
            "" | "0" | "false" => Ok(Some(false)),
            "1" | "true" => Ok(Some(true)),
            other => Err(de::Error::custom(format!(
                "do_sample must be a boolean, got {other:?}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> GenerationDefaults {
        GenerationDefaults {
            max_length_ceiling: 100,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
        }
    }

    fn raw(json: serde_json::Value) -> RawParameters {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn accepts_exactly_one_length_field() {
        let params = validate(
            &raw(serde_json::json!({ "max_length": 10 })),
            LengthRequirement::Required,
            &defaults(),
        )
        .unwrap();
        assert_eq!(params.length, Some(LengthConstraint::MaxLength(10)));

        let params = validate(
            &raw(serde_json::json!({ "max_new_tokens": 5 })),
            LengthRequirement::Required,
            &defaults(),
        )
        .unwrap();
        assert_eq!(params.length, Some(LengthConstraint::MaxNewTokens(5)));
    }

    #[test]
    fn rejects_both_length_fields_naming_them() {
        for requirement in [LengthRequirement::Required, LengthRequirement::Optional] {
            let err = validate(
                &raw(serde_json::json!({ "max_length": 10, "max_new_tokens": 5 })),
                requirement,
                &defaults(),
            )
            .unwrap_err();
            let message = err.to_string();
            assert!(message.contains("max_length"), "{message}");
            assert!(message.contains("max_new_tokens"), "{message}");
        }
    }

    #[test]
    fn missing_length_depends_on_requirement() {
        let empty = RawParameters::default();
        assert_eq!(
            validate(&empty, LengthRequirement::Required, &defaults()).unwrap_err(),
            ValidationError::MissingLength
        );
        let params = validate(&empty, LengthRequirement::Optional, &defaults()).unwrap();
        assert_eq!(params.length, None);
        assert_eq!(params.sampling, Sampling::Greedy);
    }

    #[test]
    fn length_bounds_are_errors_not_clamps() {
        let err = validate(
            &raw(serde_json::json!({ "max_new_tokens": 0 })),
            LengthRequirement::Required,
            &defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NonPositive { field: "max_new_tokens", .. }));

        let err = validate(
            &raw(serde_json::json!({ "max_length": 101 })),
            LengthRequirement::Required,
            &defaults(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::AboveCeiling {
                field: "max_length",
                ceiling: 100,
                ..
            }
        ));
    }

    #[test]
    fn greedy_ignores_sampling_fields() {
        let params = validate(
            &raw(serde_json::json!({
                "max_length": 10,
                "temperature": -3.0,
                "top_p": 7.0,
                "top_k": -1
            })),
            LengthRequirement::Required,
            &defaults(),
        )
        .unwrap();
        assert_eq!(params.sampling, Sampling::Greedy);
    }

    #[test]
    fn sampling_applies_defaults_and_checks_ranges() {
        let params = validate(
            &raw(serde_json::json!({ "max_length": 10, "do_sample": true, "top_k": 5 })),
            LengthRequirement::Required,
            &defaults(),
        )
        .unwrap();
        assert_eq!(
            params.sampling,
            Sampling::Sample {
                temperature: 0.7,
                top_k: 5,
                top_p: 0.9
            }
        );

        let cases = [
            serde_json::json!({ "do_sample": 1, "temperature": 0.0 }),
            serde_json::json!({ "do_sample": 1, "top_p": 0.0 }),
            serde_json::json!({ "do_sample": 1, "top_p": 1.5 }),
            serde_json::json!({ "do_sample": 1, "top_k": -2 }),
        ];
        for case in cases {
            assert!(
                validate(&raw(case.clone()), LengthRequirement::Optional, &defaults()).is_err(),
                "{case}"
            );
        }
    }

    #[test]
    fn do_sample_accepts_string_and_integer_forms() {
        assert_eq!(raw(serde_json::json!({ "do_sample": "1" })).do_sample, Some(true));
        assert_eq!(raw(serde_json::json!({ "do_sample": "0" })).do_sample, Some(false));
        assert_eq!(raw(serde_json::json!({ "do_sample": 1 })).do_sample, Some(true));
        assert_eq!(raw(serde_json::json!({ "do_sample": false })).do_sample, Some(false));
        assert_eq!(raw(serde_json::json!({})).do_sample, None);
        assert!(serde_json::from_value::<RawParameters>(serde_json::json!({ "do_sample": "maybe" })).is_err());
    }
}
