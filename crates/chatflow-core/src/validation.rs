//! Stateless field validators used by question nodes.
//!
//! Every validator is a pure function of its input: no network, no state.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Value;

/// Tax-id scheme whose check digits are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Jurisdiction {
    /// Brazilian individual taxpayer number (11 digits, mod-11 check pair).
    BrCpf,
    /// Brazilian company number (14 digits, weighted mod-11 check pair).
    BrCnpj,
    /// Portuguese NIF (9 digits, mod-11 check digit).
    PtNif,
}

fn default_min_digits() -> usize {
    8
}

fn default_max_digits() -> usize {
    15
}

/// Expected shape of a question reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputType {
    #[default]
    Text,
    Email,
    Number,
    #[serde(rename_all = "camelCase")]
    TaxId { jurisdiction: Jurisdiction },
    #[serde(rename_all = "camelCase")]
    Phone {
        #[serde(default = "default_min_digits")]
        min_digits: usize,
        #[serde(default = "default_max_digits")]
        max_digits: usize,
    },
    Custom { pattern: String },
}

impl InputType {
    pub fn phone() -> Self {
        Self::Phone {
            min_digits: default_min_digits(),
            max_digits: default_max_digits(),
        }
    }

    /// A value that passes this validator, used by previews.
    pub fn sample(&self) -> String {
        match self {
            Self::Text | Self::Custom { .. } => "sample".to_string(),
            Self::Email => "user@example.com".to_string(),
            Self::Number => "1".to_string(),
            Self::TaxId {
                jurisdiction: Jurisdiction::BrCpf,
            } => "52998224725".to_string(),
            Self::TaxId {
                jurisdiction: Jurisdiction::BrCnpj,
            } => "11222333000181".to_string(),
            Self::TaxId {
                jurisdiction: Jurisdiction::PtNif,
            } => "123456789".to_string(),
            Self::Phone { min_digits, .. } => "5".repeat((*min_digits).max(1)),
        }
    }
}

/// Outcome of a validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub ok: bool,
    pub normalized: Option<Value>,
}

impl Validated {
    fn pass(value: impl Into<Value>) -> Self {
        Self {
            ok: true,
            normalized: Some(value.into()),
        }
    }

    fn fail() -> Self {
        Self {
            ok: false,
            normalized: None,
        }
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)+$")
            .expect("static email regex")
    })
}

/// Validate a raw reply against an input type.
pub fn validate(input_type: &InputType, raw: &str) -> Validated {
    let trimmed = raw.trim();
    match input_type {
        InputType::Text => {
            if trimmed.is_empty() {
                Validated::fail()
            } else {
                Validated::pass(trimmed)
            }
        }
        InputType::Email => {
            if email_regex().is_match(trimmed) {
                Validated::pass(trimmed.to_lowercase())
            } else {
                Validated::fail()
            }
        }
        InputType::Number => {
            let candidate = trimmed.replace(',', ".");
            match candidate.parse::<f64>() {
                Ok(n) if n.is_finite() => Validated::pass(n),
                _ => Validated::fail(),
            }
        }
        InputType::TaxId { jurisdiction } => validate_tax_id(*jurisdiction, trimmed),
        InputType::Phone {
            min_digits,
            max_digits,
        } => validate_phone(trimmed, *min_digits, *max_digits),
        InputType::Custom { pattern } => match Regex::new(pattern) {
            Ok(re) if re.is_match(trimmed) => Validated::pass(trimmed),
            Ok(_) => Validated::fail(),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid custom validation pattern");
                Validated::fail()
            }
        },
    }
}

/// Phone numbers: formatting characters are stripped, only digits remain.
fn validate_phone(raw: &str, min: usize, max: usize) -> Validated {
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.');
    if raw.is_empty() || !raw.chars().all(allowed) {
        return Validated::fail();
    }
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < min || digits.len() > max {
        return Validated::fail();
    }
    Validated::pass(digits)
}

fn validate_tax_id(jurisdiction: Jurisdiction, raw: &str) -> Validated {
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, '.' | '-' | '/' | ' ');
    if !raw.chars().all(allowed) {
        return Validated::fail();
    }
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    let ok = match jurisdiction {
        Jurisdiction::BrCpf => cpf_is_valid(&digits),
        Jurisdiction::BrCnpj => cnpj_is_valid(&digits),
        Jurisdiction::PtNif => nif_is_valid(&digits),
    };
    if ok {
        Validated::pass(digits.iter().map(|d| char::from_digit(*d, 10).unwrap_or('0')).collect::<String>())
    } else {
        Validated::fail()
    }
}

fn all_same(digits: &[u32]) -> bool {
    digits.windows(2).all(|w| w[0] == w[1])
}

fn mod11_digit(sum: u32) -> u32 {
    let rest = sum % 11;
    if rest < 2 {
        0
    } else {
        11 - rest
    }
}

fn cpf_is_valid(d: &[u32]) -> bool {
    if d.len() != 11 || all_same(d) {
        return false;
    }
    let first: u32 = (0..9).map(|i| d[i] * (10 - i as u32)).sum();
    if mod11_digit(first) != d[9] {
        return false;
    }
    let second: u32 = (0..10).map(|i| d[i] * (11 - i as u32)).sum();
    mod11_digit(second) == d[10]
}

fn cnpj_is_valid(d: &[u32]) -> bool {
    const W1: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const W2: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    if d.len() != 14 || all_same(d) {
        return false;
    }
    let first: u32 = W1.iter().zip(d).map(|(w, x)| w * x).sum();
    if mod11_digit(first) != d[12] {
        return false;
    }
    let second: u32 = W2.iter().zip(d).map(|(w, x)| w * x).sum();
    mod11_digit(second) == d[13]
}

fn nif_is_valid(d: &[u32]) -> bool {
    if d.len() != 9 || !matches!(d[0], 1 | 2 | 3 | 5 | 6 | 8 | 9) {
        return false;
    }
    let sum: u32 = (0..8).map(|i| d[i] * (9 - i as u32)).sum();
    let check = match 11 - sum % 11 {
        10 | 11 => 0,
        n => n,
    };
    check == d[8]
}
