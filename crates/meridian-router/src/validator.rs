//! Segment validators for parameter and wildcard nodes.
//!
//! A validator is attached to a pattern marker with angle brackets:
//!
//! ```text
//! /users/:id<isnum>
//! /orders/:no<min:100>
//! /codes/:code<^[a-z]{3}$>
//! /files/*path<len:64>
//! ```

use regex::Regex;

use crate::RouterError;

/// A predicate over a captured segment.
#[derive(Debug, Clone)]
pub struct Validator {
    spec: String,
    kind: ValidatorKind,
}

#[derive(Debug, Clone)]
enum ValidatorKind {
    IsNum,
    Alpha,
    Alnum,
    Min(i64),
    Max(i64),
    Len(usize),
    Regex(Regex),
}

impl Validator {
    /// Parses a validator spec.
    ///
    /// Specs starting with `^` are compiled as regular expressions.
    pub fn parse(spec: &str) -> Result<Self, RouterError> {
        let kind = if spec.starts_with('^') {
            let re = Regex::new(spec).map_err(|e| RouterError::InvalidValidator {
                validator: spec.to_string(),
                reason: e.to_string(),
            })?;
            ValidatorKind::Regex(re)
        } else {
            let (name, arg) = match spec.split_once(':') {
                Some((name, arg)) => (name, Some(arg)),
                None => (spec, None),
            };
            match (name, arg) {
                ("isnum", None) => ValidatorKind::IsNum,
                ("alpha", None) => ValidatorKind::Alpha,
                ("alnum", None) => ValidatorKind::Alnum,
                ("min", Some(arg)) => ValidatorKind::Min(parse_arg(spec, arg)?),
                ("max", Some(arg)) => ValidatorKind::Max(parse_arg(spec, arg)?),
                ("len", Some(arg)) => ValidatorKind::Len(parse_arg(spec, arg)?),
                _ => return Err(RouterError::UnknownValidator(spec.to_string())),
            }
        };

        Ok(Self {
            spec: spec.to_string(),
            kind,
        })
    }

    /// Returns the spec this validator was parsed from.
    #[must_use]
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Returns `true` if the segment satisfies the validator.
    #[must_use]
    pub fn accepts(&self, segment: &str) -> bool {
        match &self.kind {
            ValidatorKind::IsNum => {
                !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
            }
            ValidatorKind::Alpha => {
                !segment.is_empty() && segment.chars().all(char::is_alphabetic)
            }
            ValidatorKind::Alnum => {
                !segment.is_empty() && segment.chars().all(char::is_alphanumeric)
            }
            ValidatorKind::Min(min) => segment.parse::<i64>().is_ok_and(|n| n >= *min),
            ValidatorKind::Max(max) => segment.parse::<i64>().is_ok_and(|n| n <= *max),
            ValidatorKind::Len(len) => segment.chars().count() <= *len,
            ValidatorKind::Regex(re) => re.is_match(segment),
        }
    }
}

impl PartialEq for Validator {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

impl Eq for Validator {}

fn parse_arg<T: std::str::FromStr>(spec: &str, arg: &str) -> Result<T, RouterError> {
    arg.trim().parse().map_err(|_| RouterError::InvalidValidator {
        validator: spec.to_string(),
        reason: format!("'{arg}' is not a number"),
    })
}
