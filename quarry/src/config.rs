use serde::Deserialize;
use std::time::Duration;

/// Connection-wide defaults applied to every query built from a [`Connection`](crate::Connection).
///
/// Query options set on an individual builder always take precedence.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Reject filter paths that are not declared in the schema.
    pub strict_query: bool,
    /// Run update validators unless a query opts out.
    pub run_validators: bool,
    /// Emit `$within` and legacy coordinate-pair `$near` instead of
    /// `$geoWithin` and GeoJSON `$near`.
    pub legacy_geo: bool,
    /// Dispatches slower than this are logged on the `quarry::slow_query` target.
    #[serde(with = "millis")]
    pub slow_query_threshold: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strict_query: false,
            run_validators: false,
            legacy_geo: false,
            slow_query_threshold: Some(Duration::from_millis(500)),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{self, doc};

    #[test]
    fn deserializes_partial_config() {
        let config: Config = bson::from_document(doc! {
            "strictQuery": true,
            "slowQueryThreshold": 25_i64,
        })
        .unwrap();

        assert!(config.strict_query);
        assert!(!config.legacy_geo);
        assert_eq!(config.slow_query_threshold, Some(Duration::from_millis(25)));
    }
}
