//! Serde helpers for venue payloads that encode numbers as strings.

use serde::{Deserialize, Deserializer, de::Error};
use std::{borrow::Cow, fmt::Display, str::FromStr};

/// Deserialize a `String` as the desired type.
pub fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let data: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
    data.parse::<T>().map_err(D::Error::custom)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StrOrNumber<'a, N> {
    Number(N),
    #[serde(borrow)]
    Str(Cow<'a, str>),
}

/// Deserialize either a JSON number or a numeric string as an `f64`.
pub fn de_str_or_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match StrOrNumber::<f64>::deserialize(deserializer)? {
        StrOrNumber::Number(number) => Ok(number),
        StrOrNumber::Str(data) => data.trim().parse::<f64>().map_err(D::Error::custom),
    }
}

/// Deserialize either a JSON integer or an integer string as an `i64`.
pub fn de_str_or_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match StrOrNumber::<i64>::deserialize(deserializer)? {
        StrOrNumber::Number(number) => Ok(number),
        StrOrNumber::Str(data) => data.trim().parse::<i64>().map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Numbers {
        #[serde(deserialize_with = "de_str")]
        strict: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        either: f64,
        #[serde(deserialize_with = "de_str_or_i64")]
        time: i64,
    }

    #[test]
    fn test_de_numbers() {
        struct TestCase {
            input: &'static str,
            expected: Option<(f64, f64, i64)>,
        }

        let tests = vec![
            TestCase {
                // TC0: strings everywhere
                input: r#"{"strict": "1.5", "either": "2.25", "time": "1672304486865"}"#,
                expected: Some((1.5, 2.25, 1672304486865)),
            },
            TestCase {
                // TC1: numbers where permitted
                input: r#"{"strict": "1.5", "either": 2.25, "time": 1672304486865}"#,
                expected: Some((1.5, 2.25, 1672304486865)),
            },
            TestCase {
                // TC2: strict field rejects a number
                input: r#"{"strict": 1.5, "either": 2.25, "time": 1}"#,
                expected: None,
            },
            TestCase {
                // TC3: non-numeric string
                input: r#"{"strict": "1.5", "either": "abc", "time": 1}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<Numbers>(test.input)
                .ok()
                .map(|numbers| (numbers.strict, numbers.either, numbers.time));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
