//! Kubernetes resource quantity arithmetic.

use crate::crd::ResourceList;
use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parses a quantity into base units (cores, bytes, pods).
pub fn parse(quantity: &str) -> Result<f64> {
    let s = quantity.trim();
    if s.is_empty() {
        return Err(OperatorError::Configuration("empty quantity".to_string()));
    }
    let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    // "1e3" is an exponent, "1E" is exa
    let is_exponent = (suffix.starts_with('e') || suffix.starts_with('E'))
        && suffix.len() > 1
        && suffix[1..].parse::<i32>().is_ok();
    let (number, suffix) = if is_exponent { (s, "") } else { (number, suffix) };

    let base: f64 = number
        .parse()
        .map_err(|_| OperatorError::Configuration(format!("invalid quantity {:?}", quantity)))?;
    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Ei" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(OperatorError::Configuration(format!(
                "invalid quantity suffix {:?} in {:?}",
                other, quantity
            )))
        }
    };
    Ok(base * multiplier)
}

pub fn value(quantity: &Quantity) -> Result<f64> {
    parse(&quantity.0)
}

/// Unparseable quantities count as zero
pub fn is_zero(quantity: &Quantity) -> bool {
    value(quantity).map(|v| v == 0.0).unwrap_or(true)
}

/// Whether every request fits in the available total. A resource missing
/// from `total` only fits a zero request.
pub fn fits(requests: &ResourceList, total: &ResourceList) -> bool {
    requests.iter().all(|(name, requested)| {
        let requested = value(requested).unwrap_or(f64::INFINITY);
        let available = total.get(name).and_then(|q| value(q).ok()).unwrap_or(0.0);
        requested <= available
    })
}
