//! Serde adapters for the broker's admin API conventions:
//! durations cross the wire as integer nanoseconds and unset numeric
//! limits as `-1`.

pub(crate) mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_nanos())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

macro_rules! nullable {
    ($name:ident, $unsigned:ty, $signed:ty) => {
        pub(crate) mod $name {
            use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

            #[expect(clippy::ref_option, reason = "serde passes fields by reference")]
            pub(crate) fn serialize<S: Serializer>(
                num: &Option<$unsigned>,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                match *num {
                    Some(num) => <$signed>::try_from(num)
                        .map_err(|_| serde::ser::Error::custom("limit out of range"))?,
                    None => -1,
                }
                .serialize(serializer)
            }

            pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Option<$unsigned>, D::Error> {
                let num = <$signed>::deserialize(deserializer)?;
                if num < 0 {
                    Ok(None)
                } else {
                    <$unsigned>::try_from(num)
                        .map(Some)
                        .map_err(de::Error::custom)
                }
            }
        }
    };
}

nullable!(nullable_u64, u64, i64);
nullable!(nullable_u32, u32, i64);

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::duration_nanos")]
        window: Duration,
        #[serde(with = "super::nullable_u64")]
        limit: Option<u64>,
    }

    #[test]
    fn round_trips() {
        let value = Wrapper {
            window: Duration::from_secs(30),
            limit: None,
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(r#"{"window":30000000000,"limit":-1}"#, json);
        assert_eq!(value, serde_json::from_str(&json).unwrap());

        let value = Wrapper {
            window: Duration::from_millis(500),
            limit: Some(10_000),
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(r#"{"window":500000000,"limit":10000}"#, json);
        assert_eq!(value, serde_json::from_str(&json).unwrap());
    }
}
