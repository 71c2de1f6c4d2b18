// 🧮 Ledger arithmetic - lenient amount parsing and debit/credit totals
//
// Amounts arrive as free text from the processing function.
// Anything that does not start with a number counts as zero.

use serde::{Deserialize, Serialize};

/// Parse the longest numeric prefix of `raw` (after leading whitespace).
/// Missing, unparsable or non-finite values yield 0.0.
pub fn parse_amount(raw: Option<&str>) -> f64 {
    let text = match raw {
        Some(t) => t.trim_start(),
        None => return 0.0,
    };

    let bytes = text.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }

    if digits == 0 {
        return 0.0;
    }

    // Optional exponent, only taken when it has digits
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    match text[..end].parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Running debit/credit totals for one group of records
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTotals {
    pub count: usize,
    pub dolguja: f64,
    pub pobaruva: f64,
}

impl SourceTotals {
    pub fn add(&mut self, dolguja: f64, pobaruva: f64) {
        self.count += 1;
        self.dolguja += dolguja;
        self.pobaruva += pobaruva;
    }

    /// Credit minus debit
    pub fn balance(&self) -> f64 {
        self.pobaruva - self.dolguja
    }
}
