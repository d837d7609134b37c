use std::fmt::Display;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// Parses values that event feeds encode as strings, like big integers and block numbers.
pub fn deserialize_str_to_from_str<'de, D, I>(deserializer: D) -> Result<I, D::Error>
where
    D: Deserializer<'de>,
    I: FromStr,
    <I as FromStr>::Err: Display,
{
    let num: String = Deserialize::deserialize(deserializer)?;
    num.parse::<I>().map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use serde::Deserialize;

    use super::deserialize_str_to_from_str;

    #[derive(Deserialize)]
    struct Record {
        #[serde(deserialize_with = "deserialize_str_to_from_str")]
        amount: U256,
        #[serde(deserialize_with = "deserialize_str_to_from_str")]
        block_number: u64,
    }

    #[test]
    fn big_integers_parse_from_decimal_strings() {
        let record: Record = serde_json::from_value(serde_json::json!({
            "amount": "115792089237316195423570985008687907853269984665640564039457584007913129639935",
            "block_number": "42",
        }))
        .unwrap();

        assert_eq!(record.amount, U256::MAX);
        assert_eq!(record.block_number, 42);
    }

    #[test]
    fn non_numeric_strings_are_rejected() {
        let result: Result<Record, _> = serde_json::from_value(serde_json::json!({
            "amount": "ten",
            "block_number": "42",
        }));

        assert!(result.is_err());
    }
}
