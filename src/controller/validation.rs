//! Validation for replica specs and storage sizes
//!
//! Storage sizes are Kubernetes quantities ("1Gi", "500M", "1.5Ti", "2e9").
//! They are parsed into nano-units, the finest precision a Kubernetes
//! quantity carries, so sizes written with different suffixes compare exactly.

use crate::controller::error::{Error, Result};
use crate::crd::Pgreplica;

/// Maximum valid length for Kubernetes label values (RFC 1123)
const MAX_LABEL_VALUE_LENGTH: usize = 63;

const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// Parse a Kubernetes quantity into nano-units
///
/// Precision beyond 1n is rounded up, as the API server does.
///
/// Supports binary suffixes (Ki, Mi, Gi, Ti, Pi, Ei), decimal suffixes
/// (n, u, m, k, M, G, T, P, E) and decimal exponents ("1e3", "5E-1").
pub fn parse_quantity_nanos(value: &str) -> Result<i128> {
    let invalid = |reason: &str| {
        Error::ValidationError(format!("invalid quantity {:?}: {}", value, reason))
    };

    let s = value.trim();
    if s.is_empty() {
        return Err(invalid("empty"));
    }

    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let number_len = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_len);

    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid("missing number"));
    }
    if frac.contains('.') {
        return Err(invalid("more than one decimal point"));
    }

    let digits = format!("{}{}", whole, frac);
    let mantissa: i128 = digits
        .parse()
        .map_err(|_| invalid("number out of range"))?;
    let frac_digits = u32::try_from(frac.len()).map_err(|_| invalid("too many digits"))?;

    let (num, den) = suffix_ratio(suffix).ok_or_else(|| invalid("unknown suffix"))?;

    // nanos = mantissa * num * 10^9 / (10^frac_digits * den), rounded up
    let numerator = mantissa
        .checked_mul(num)
        .and_then(|v| v.checked_mul(NANOS_PER_UNIT))
        .ok_or_else(|| invalid("value too large"))?;
    let denominator = 10i128
        .checked_pow(frac_digits)
        .and_then(|v| v.checked_mul(den))
        .ok_or_else(|| invalid("too many fractional digits"))?;

    let mut nanos = numerator / denominator;
    if numerator % denominator != 0 {
        nanos += 1;
    }

    Ok(if negative { -nanos } else { nanos })
}

/// Multiplier for a quantity suffix as a (numerator, denominator) pair
fn suffix_ratio(suffix: &str) -> Option<(i128, i128)> {
    let binary = |power: u32| 1024i128.checked_pow(power).map(|v| (v, 1));
    let decimal = |power: u32| 10i128.checked_pow(power).map(|v| (v, 1));

    match suffix {
        "" => Some((1, 1)),
        "Ki" => binary(1),
        "Mi" => binary(2),
        "Gi" => binary(3),
        "Ti" => binary(4),
        "Pi" => binary(5),
        "Ei" => binary(6),
        "n" => Some((1, 1_000_000_000)),
        "u" => Some((1, 1_000_000)),
        "m" => Some((1, 1000)),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        exp => {
            let rest = exp.strip_prefix('e').or_else(|| exp.strip_prefix('E'))?;
            let power: i32 = rest.parse().ok()?;
            let magnitude = 10i128.checked_pow(power.unsigned_abs())?;
            if power >= 0 {
                Some((magnitude, 1))
            } else {
                Some((1, magnitude))
            }
        }
    }
}

/// Validate that a PVC can be resized from `old_size` to `new_size`
///
/// An empty old size is treated as "0". Both sizes must parse and the new
/// size must be strictly larger: claims cannot shrink.
pub fn validate_pvc_resize(old_size: &str, new_size: &str) -> Result<()> {
    let old_size = if old_size.trim().is_empty() {
        "0"
    } else {
        old_size
    };

    let old = parse_quantity_nanos(old_size)?;
    let new = parse_quantity_nanos(new_size)?;

    if new <= old {
        return Err(Error::ValidationError(format!(
            "new PVC size {} must be greater than the current size {}",
            new_size, old_size
        )));
    }

    Ok(())
}

/// Validate that a string is valid for use in a Kubernetes label selector.
///
/// Label values must:
/// - Be 63 characters or less
/// - Contain only alphanumeric characters, '-', '_', or '.'
/// - Begin and end with an alphanumeric character
pub fn validate_label_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::ValidationError(
            "label value cannot be empty".to_string(),
        ));
    }

    if value.len() > MAX_LABEL_VALUE_LENGTH {
        return Err(Error::ValidationError(format!(
            "label value {:?} exceeds {} characters",
            value, MAX_LABEL_VALUE_LENGTH
        )));
    }

    if !value.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !value.ends_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(Error::ValidationError(format!(
            "label value {:?} must start and end with an alphanumeric character",
            value
        )));
    }

    if let Some(c) = value
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::ValidationError(format!(
            "invalid character '{}' in label value {:?}",
            c, value
        )));
    }

    Ok(())
}

/// Validate a replica before provisioning it
pub fn validate_replica(replica: &Pgreplica) -> Result<()> {
    validate_label_value(&replica.spec.name)?;
    validate_label_value(&replica.spec.cluster_name)?;

    let size = &replica.spec.replica_storage.size;
    if !size.is_empty() {
        let nanos = parse_quantity_nanos(size)?;
        if nanos <= 0 {
            return Err(Error::ValidationError(format!(
                "replica storage size must be positive: {}",
                size
            )));
        }
    }

    Ok(())
}
