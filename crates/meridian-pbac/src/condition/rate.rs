//! Statement-level rate limit.

use meridian_core::Context;
use meridian_middleware::RateBucket;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse, Condition};
use crate::error::{PbacError, PbacResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateSpec {
    /// Tokens per second.
    speed: f64,
    /// Burst size.
    max: u32,
}

/// Matches while the statement's own bucket has tokens.
///
/// The bucket belongs to the condition, so every request evaluated against
/// the statement draws from it regardless of user or address.
#[derive(Debug)]
pub struct RateCondition {
    spec: RateSpec,
    bucket: RateBucket,
}

impl RateCondition {
    /// Parses `{"speed": 5, "max": 10}`.
    ///
    /// # Errors
    ///
    /// Returns an error if `speed` is not positive.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        let spec: RateSpec = parse("rate", value)?;
        if !(spec.speed.is_finite() && spec.speed > 0.0) {
            return Err(PbacError::invalid_condition("rate", "speed must be positive"));
        }
        Ok(Self {
            bucket: RateBucket::per_second(spec.speed, spec.max),
            spec,
        })
    }
}

impl Condition for RateCondition {
    fn name(&self) -> &'static str {
        "rate"
    }

    fn matches(&self, _: &Context) -> bool {
        self.bucket.try_take(1)
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self.spec).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};
    use meridian_core::Request;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_drains_and_refills() {
        let cond = RateCondition::from_value(json!({"speed": 1, "max": 2})).unwrap();
        let ctx = Context::recorded(Request::new(Method::GET, Uri::from_static("/"))).0;

        assert!(cond.matches(&ctx));
        assert!(cond.matches(&ctx));
        assert!(!cond.matches(&ctx));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(cond.matches(&ctx));
    }

    #[test]
    fn test_rejects_non_positive_speed() {
        assert!(RateCondition::from_value(json!({"speed": 0, "max": 2})).is_err());
        assert!(RateCondition::from_value(json!({"speed": 1})).is_err());
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let cond = RateCondition::from_value(json!({"speed": 2.5, "max": 4})).unwrap();
        assert_eq!(cond.to_value(), json!({"speed": 2.5, "max": 4}));
    }
}
