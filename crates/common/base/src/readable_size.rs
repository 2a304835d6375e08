// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Human readable byte sizes such as `256KiB` or `5MiB`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{OptionExt, Snafu, ensure};

const UNIT: u64 = 1024;
const KIB: u64 = UNIT;
const MIB: u64 = KIB * UNIT;
const GIB: u64 = MIB * UNIT;
const TIB: u64 = GIB * UNIT;

/// A size in bytes.
///
/// Parses from plain integers or from a number followed by a unit
/// (`B`, `K`/`KB`/`KiB`, `M`/`MB`/`MiB`, `G`/`GB`/`GiB`, `T`/`TB`/`TiB`).
/// All units are binary. Serializes back to the largest exact unit.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> Self { Self(count * KIB) }

    pub const fn mb(count: u64) -> Self { Self(count * MIB) }

    pub const fn gb(count: u64) -> Self { Self(count * GIB) }

    pub const fn as_bytes(self) -> u64 { self.0 }

    pub const fn as_kb(self) -> u64 { self.0 / KIB }

    pub const fn as_mb(self) -> u64 { self.0 / MIB }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ParseSizeError {
    #[snafu(display("invalid size `{input}`: empty"))]
    Empty { input: String },

    #[snafu(display("invalid size `{input}`: bad number"))]
    BadNumber { input: String },

    #[snafu(display("invalid size `{input}`: unknown unit `{unit}`"))]
    UnknownUnit { input: String, unit: String },
}

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        ensure!(!trimmed.is_empty(), EmptySnafu { input });

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            "t" | "tb" | "tib" => TIB,
            other => {
                return UnknownUnitSnafu {
                    input,
                    unit: other,
                }
                .fail();
            }
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(Self)
                .context(BadNumberSnafu { input });
        }

        let fractional: f64 = number.parse().ok().context(BadNumberSnafu { input })?;
        ensure!(
            fractional.is_finite() && fractional >= 0.0,
            BadNumberSnafu { input }
        );
        Ok(Self((fractional * multiplier as f64) as u64))
    }
}

impl fmt::Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0;
        if size == 0 {
            return write!(f, "0B");
        }
        for (unit, suffix) in [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")] {
            if size % unit == 0 {
                return write!(f, "{}{suffix}", size / unit);
            }
        }
        write!(f, "{size}B")
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string like \"256KiB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ReadableSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ReadableSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_units() {
        assert_eq!("0".parse::<ReadableSize>(), Ok(ReadableSize(0)));
        assert_eq!("512B".parse::<ReadableSize>(), Ok(ReadableSize(512)));
        assert_eq!("256KiB".parse::<ReadableSize>(), Ok(ReadableSize::kb(256)));
        assert_eq!("5mb".parse::<ReadableSize>(), Ok(ReadableSize::mb(5)));
        assert_eq!(" 1 G ".parse::<ReadableSize>(), Ok(ReadableSize::gb(1)));
        assert_eq!("1.5MiB".parse::<ReadableSize>(), Ok(ReadableSize(1_572_864)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<ReadableSize>().is_err());
        assert!("abc".parse::<ReadableSize>().is_err());
        assert!("12XB".parse::<ReadableSize>().is_err());
    }

    #[test]
    fn display_uses_largest_exact_unit() {
        assert_eq!(ReadableSize(0).to_string(), "0B");
        assert_eq!(ReadableSize(1000).to_string(), "1000B");
        assert_eq!(ReadableSize::kb(256).to_string(), "256KiB");
        assert_eq!(ReadableSize::mb(1024).to_string(), "1GiB");
    }

    #[test]
    fn serde_accepts_numbers_and_strings() {
        let from_str: ReadableSize = serde_json::from_str("\"64KiB\"").unwrap();
        let from_num: ReadableSize = serde_json::from_str("65536").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "\"64KiB\"");
    }
}
