// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashSet;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Set of HTTP status codes, parsed from a list such as `"400-408,500"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCodeSet {
    ranges: Vec<RangeInclusive<u16>>,
}

impl StatusCodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = RangeInclusive<u16>>) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    pub fn contains(&self, code: u16) -> bool {
        self.ranges.iter().any(|range| range.contains(&code))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromStr for StatusCodeSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parse = |v: &str| {
                v.trim()
                    .parse::<u16>()
                    .map_err(|_| ConfigError::StatusCode(part.to_string()))
            };
            let range = match part.split_once('-') {
                Some((low, high)) => {
                    let (low, high) = (parse(low)?, parse(high)?);
                    if low > high {
                        return Err(ConfigError::StatusCode(part.to_string()));
                    }
                    low..=high
                }
                None => {
                    let code = parse(part)?;
                    code..=code
                }
            };
            ranges.push(range);
        }
        Ok(Self { ranges })
    }
}

/// Error classes and status codes that are never recorded.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    pub classes: HashSet<String>,
    pub status_codes: StatusCodeSet,
}

impl IgnoreRules {
    pub fn is_ignored(&self, class_name: &str, status_code: Option<u16>) -> bool {
        self.classes.contains(class_name)
            || status_code.is_some_and(|code| self.status_codes.contains(code))
    }
}
