//! Conditions on the request itself.

use http::Method;
use indexmap::IndexMap;
use meridian_core::{Context, IpNet};
use serde_json::Value;

use super::{parse, Condition};
use crate::error::{PbacError, PbacResult};

/// Matches when the client address falls in one of the networks.
#[derive(Debug, Clone)]
pub struct SourceIpCondition {
    nets: Vec<IpNet>,
}

impl SourceIpCondition {
    /// Parses `["10.0.0.0/8", "192.168.1.7"]`.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is not an address or CIDR network.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        Ok(Self {
            nets: parse("sourceip", value)?,
        })
    }
}

impl Condition for SourceIpCondition {
    fn name(&self) -> &'static str {
        "sourceip"
    }

    fn matches(&self, ctx: &Context) -> bool {
        ctx.real_ip()
            .is_some_and(|ip| self.nets.iter().any(|net| net.contains(ip)))
    }

    fn to_value(&self) -> Value {
        Value::Array(
            self.nets
                .iter()
                .map(|net| Value::String(net.to_string()))
                .collect(),
        )
    }
}

/// Matches requests using one of the methods.
#[derive(Debug, Clone)]
pub struct MethodCondition {
    methods: Vec<Method>,
}

impl MethodCondition {
    /// Parses `["GET", "HEAD"]`.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is not a method token.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        let names: Vec<String> = parse("method", value)?;
        let methods = names
            .iter()
            .map(|name| {
                Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                    .map_err(|e| PbacError::invalid_condition("method", e))
            })
            .collect::<PbacResult<_>>()?;
        Ok(Self { methods })
    }
}

impl Condition for MethodCondition {
    fn name(&self) -> &'static str {
        "method"
    }

    fn matches(&self, ctx: &Context) -> bool {
        self.methods.contains(ctx.request().method())
    }

    fn to_value(&self) -> Value {
        Value::Array(
            self.methods
                .iter()
                .map(|m| Value::String(m.as_str().to_string()))
                .collect(),
        )
    }
}

/// Matches one of the exact request paths.
#[derive(Debug, Clone)]
pub struct PathCondition {
    paths: Vec<String>,
}

impl PathCondition {
    /// Parses `["/a", "/b"]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a list of strings.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        Ok(Self {
            paths: parse("path", value)?,
        })
    }
}

impl Condition for PathCondition {
    fn name(&self) -> &'static str {
        "path"
    }

    fn matches(&self, ctx: &Context) -> bool {
        let path = ctx.request().path();
        self.paths.iter().any(|p| p == path)
    }

    fn to_value(&self) -> Value {
        Value::from(self.paths.clone())
    }
}

/// Every listed param must hold one of its allowed values.
#[derive(Debug, Clone)]
pub struct ParamsCondition {
    allowed: IndexMap<String, Vec<String>>,
}

impl ParamsCondition {
    /// Parses `{"team": ["core", "infra"]}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object of string lists.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        Ok(Self {
            allowed: parse("params", value)?,
        })
    }
}

impl Condition for ParamsCondition {
    fn name(&self) -> &'static str {
        "params"
    }

    fn matches(&self, ctx: &Context) -> bool {
        self.allowed.iter().all(|(key, values)| {
            ctx.param(key)
                .is_some_and(|actual| values.iter().any(|v| v == actual))
        })
    }

    fn to_value(&self) -> Value {
        Value::Object(
            self.allowed
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
        )
    }
}
