// Modified version of https://github.com/sombralibre/k8s-quantity-parser
//
// Original license:
//
// MIT License
//
// Copyright (c) 2022 Alejandro Llanes
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use color_eyre::{eyre::eyre, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use lazy_static::lazy_static;
use regex::Regex;

/// Parses the storage quantities found in PV capacity maps into byte counts.
///
/// Supports the binary (Ki..Ei) and decimal (k..E) suffixes emitted by the
/// Kubernetes API. Fractional or exponent-form quantities are rejected.
pub trait QuantityParser {
    fn to_bytes(&self) -> Result<Option<i64>>;
}

fn unit_multiplier(unit: &str) -> Option<i64> {
    let mul = match unit {
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(mul)
}

impl QuantityParser for Quantity {
    fn to_bytes(&self) -> Result<Option<i64>> {
        lazy_static! {
            static ref UNIT_SUFFIX: Regex = Regex::new(r"([[:alpha:]]{1,2}$)").unwrap();
        }

        let quantity_str = &self.0;
        let Some(captures) = UNIT_SUFFIX.captures(quantity_str) else {
            return Ok(Some(quantity_str.parse::<i64>()?));
        };

        match captures.get(0) {
            Some(suffix) => {
                let multiplier = unit_multiplier(suffix.as_str())
                    .ok_or_else(|| eyre!("Invalid unit '{}' in quantity '{}'", suffix.as_str(), quantity_str))?;
                let amount = quantity_str.trim_end_matches(suffix.as_str()).parse::<i64>()?;
                Ok(Some(amount * multiplier))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_byte_count_passes_through() {
        assert_eq!(Quantity("12345".into()).to_bytes().unwrap(), Some(12345));
    }

    #[test]
    fn pow2_mb_to_bytes() {
        let mib = Quantity("1Mi".into());
        let ret: i64 = 1048576;
        assert_eq!(mib.to_bytes().ok().flatten().unwrap(), ret);
    }

    #[test]
    fn pow2_gb_to_bytes() {
        let gib = Quantity("100Gi".into());
        let ret: i64 = 100 * (1 << 30);
        assert_eq!(gib.to_bytes().ok().flatten().unwrap(), ret);
    }

    #[test]
    fn pow10_gb_to_bytes() {
        let gb = Quantity("1G".into());
        let ret: i64 = 1000000000;
        assert_eq!(gb.to_bytes().ok().flatten().unwrap(), ret);
    }

    #[test]
    fn invalid_unit_fails() {
        assert!(Quantity("12345r".into()).to_bytes().is_err())
    }

    #[test]
    fn fractional_quantity_fails() {
        assert!(Quantity("123.123".into()).to_bytes().is_err())
    }
}
