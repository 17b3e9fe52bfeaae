//! UCUM unit canonicalization for unit-aware quantity search.
//!
//! A small table of linear UCUM units grouped by dimension. Each unit maps to
//! the canonical unit of its dimension with an exact decimal factor, so that
//! `1.2 kg` and `1200 g` index to the same canonical value. Affine units
//! (Celsius) and units outside the table are left without a canonical form.

use std::str::FromStr;

use rust_decimal::Decimal;

/// The UCUM code system URI.
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

/// A value expressed in the canonical unit of its dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalQuantity {
    /// Converted value.
    pub value: Decimal,
    /// Canonical unit code (`g`, `m`, `L`, `Pa`, `s`, `%`).
    pub unit: &'static str,
}

fn lookup(code: &str) -> Option<(&'static str, &'static str)> {
    let entry = match code {
        // mass
        "g" => ("g", "1"),
        "kg" => ("g", "1000"),
        "mg" => ("g", "0.001"),
        "ug" => ("g", "0.000001"),
        "ng" => ("g", "0.000000001"),
        "[lb_av]" => ("g", "453.59237"),
        "[oz_av]" => ("g", "28.349523125"),
        // length
        "m" => ("m", "1"),
        "km" => ("m", "1000"),
        "cm" => ("m", "0.01"),
        "mm" => ("m", "0.001"),
        "[in_i]" => ("m", "0.0254"),
        "[ft_i]" => ("m", "0.3048"),
        // volume
        "L" | "l" => ("L", "1"),
        "dL" | "dl" => ("L", "0.1"),
        "mL" | "ml" => ("L", "0.001"),
        "uL" | "ul" => ("L", "0.000001"),
        // pressure
        "Pa" => ("Pa", "1"),
        "kPa" => ("Pa", "1000"),
        "mm[Hg]" => ("Pa", "133.322"),
        // time
        "s" => ("s", "1"),
        "ms" => ("s", "0.001"),
        "min" => ("s", "60"),
        "h" => ("s", "3600"),
        "d" => ("s", "86400"),
        "wk" => ("s", "604800"),
        // dimensionless
        "%" => ("%", "1"),
        _ => return None,
    };
    Some(entry)
}

/// Converts `value code` to its canonical form, if the code is known.
pub fn canonicalize(value: Decimal, code: &str) -> Option<CanonicalQuantity> {
    let (unit, factor) = lookup(code)?;
    let factor = Decimal::from_str(factor).ok()?;
    Some(CanonicalQuantity {
        value: (value * factor).normalize(),
        unit,
    })
}

/// Returns true if `system` names UCUM, or is absent.
pub fn is_ucum_system(system: Option<&str>) -> bool {
    system.is_none_or(|s| s == UCUM_SYSTEM)
}
