//! Serialization of `U256` as a decimal string, matching how amounts appear
//! on the wire.

use primitive_types::U256;
use serde::{de, Deserializer, Serializer};
use serde_with::{DeserializeAs, SerializeAs};
use std::fmt;

pub struct DecimalU256;

impl<'de> DeserializeAs<'de, U256> for DecimalU256 {
    fn deserialize_as<D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer)
    }
}

impl SerializeAs<U256> for DecimalU256 {
    fn serialize_as<S>(source: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(source, serializer)
    }
}

pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor {}
    impl de::Visitor<'_> for Visitor {
        type Value = U256;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a u256 encoded as a decimal encoded string")
        }

        fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            U256::from_dec_str(s).map_err(|err| {
                de::Error::custom(format!("failed to decode {s:?} as decimal u256: {err}"))
            })
        }
    }

    deserializer.deserialize_str(Visitor {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, Serialize, Eq, PartialEq)]
    struct Wrapper(#[serde(with = "super")] U256);

    #[test]
    fn decimal_round_trip() {
        let value = U256::from_dec_str("60000000000000000000").unwrap();
        let json = serde_json::json!("60000000000000000000");
        assert_eq!(serde_json::to_value(Wrapper(value)).unwrap(), json);
        assert_eq!(serde_json::from_value::<Wrapper>(json).unwrap(), Wrapper(value));
    }

    #[test]
    fn rejects_non_decimal() {
        assert!(serde_json::from_value::<Wrapper>(serde_json::json!("0x10")).is_err());
    }
}
