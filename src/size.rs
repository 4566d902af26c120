use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::MalformedSizeError;

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

/// Parse `<digits>[M|G]` into a byte count.
pub fn parse_size(input: &str) -> Result<u64, MalformedSizeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(MalformedSizeError::new(input, "size is empty"));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(MalformedSizeError::new(input, "expected a number"));
    }
    let multiplier = match unit {
        "" => 1,
        "M" => MIB,
        "G" => GIB,
        other => {
            return Err(MalformedSizeError::new(
                input,
                format!("unknown suffix `{other}` (expected M or G)"),
            ));
        }
    };

    let num: u64 = digits
        .parse()
        .map_err(|_| MalformedSizeError::new(input, "number out of range"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| MalformedSizeError::new(input, "size overflows 64 bits"))
}

/// Round `value` up to a multiple of `align`, `None` on overflow.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    value.div_ceil(align).checked_mul(align)
}

/// Parsed `--image-size` value.
///
/// Entries are either a bare size applying to every volume, or
/// `<selector>:<size>` where the selector is a 0-based volume index or a
/// volume name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSizeSpec {
    pub default: Option<u64>,
    pub entries: Vec<SizeEntry>,
    /// The text as given, for messages.
    pub given: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEntry {
    pub selector: String,
    pub size: u64,
}

/// Outcome of looking up the hint for one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeHint {
    None,
    Size(u64),
    Ambiguous(String),
}

impl FromStr for ImageSizeSpec {
    type Err = MalformedSizeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut spec = ImageSizeSpec {
            given: value.to_string(),
            ..Default::default()
        };
        for raw in value.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(MalformedSizeError::new(value, "empty size entry"));
            }
            match raw.split_once(':') {
                Some((selector, size)) => {
                    let selector = selector.trim();
                    if selector.is_empty() {
                        return Err(MalformedSizeError::new(value, "empty volume selector"));
                    }
                    spec.entries.push(SizeEntry {
                        selector: selector.to_string(),
                        size: parse_size(size)?,
                    });
                }
                None => {
                    let size = parse_size(raw)?;
                    if spec.default.is_some_and(|d| d != size) {
                        return Err(MalformedSizeError::new(
                            value,
                            "more than one bare size given",
                        ));
                    }
                    spec.default = Some(size);
                }
            }
        }
        Ok(spec)
    }
}

impl ImageSizeSpec {
    /// Look up the hint for the volume at `index` named `name`, given the
    /// names of all volumes in declaration order.
    ///
    /// A selector that is both the name of one volume and the index of a
    /// different volume is ambiguous for both. Two selectors reaching the
    /// same volume with different sizes are ambiguous for that volume.
    pub fn hint_for(&self, index: usize, name: &str, names: &[&str]) -> SizeHint {
        let mut sizes: Vec<(&str, u64)> = Vec::new();
        for entry in &self.entries {
            let by_name = names.iter().position(|n| *n == entry.selector);
            let by_index = entry
                .selector
                .parse::<usize>()
                .ok()
                .filter(|i| *i < names.len());
            let target = match (by_name, by_index) {
                (Some(a), Some(b)) if a != b => {
                    if a == index || b == index {
                        return SizeHint::Ambiguous(format!(
                            "selector `{}` names volume {} and indexes volume {}",
                            entry.selector, names[a], names[b]
                        ));
                    }
                    continue;
                }
                (Some(i), _) | (None, Some(i)) => i,
                (None, None) => continue,
            };
            if target == index {
                sizes.push((entry.selector.as_str(), entry.size));
            }
        }

        match sizes.split_first() {
            None => self.default.map_or(SizeHint::None, SizeHint::Size),
            Some(((_, first), rest)) => {
                if let Some((selector, other)) = rest.iter().find(|(_, s)| s != first) {
                    SizeHint::Ambiguous(format!(
                        "volume {name} given both {first} and {other} (selector `{selector}`)"
                    ))
                } else {
                    SizeHint::Size(*first)
                }
            }
        }
    }

    /// Selectors that match no volume at all.
    pub fn unmatched_selectors<'a>(&'a self, names: &[&str]) -> Vec<&'a str> {
        self.entries
            .iter()
            .filter(|e| {
                !names.contains(&e.selector.as_str())
                    && !e
                        .selector
                        .parse::<usize>()
                        .is_ok_and(|i| i < names.len())
            })
            .map(|e| e.selector.as_str())
            .collect()
    }
}
