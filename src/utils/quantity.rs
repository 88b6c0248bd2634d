//! Kubernetes-style resource quantity parsing.
//!
//! Unit prices are quoted per canonical quantity (`"1Mi"` of memory, `"1m"`
//! of CPU); this module turns those strings into numeric magnitudes so usage
//! can be normalized before pricing.

use crate::error::AppError;

/// Parse a quantity string such as `"1Mi"`, `"1m"`, `"1.5Gi"`, `"100"` into
/// its numeric magnitude.
///
/// Binary suffixes (Ki, Mi, Gi, Ti, Pi, Ei) are powers of 1024; decimal
/// suffixes (m, k, M, G, T, P, E) are powers of 1000, with `m` = 10^-3.
/// Scientific notation (`"12e3"`) is also accepted.
pub fn parse_quantity(s: &str) -> Result<f64, AppError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("empty quantity")));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let base: f64 = number
        .parse()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("invalid quantity {:?}: {}", s, e)))?;

    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => {
            if let Some(exp) = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
            {
                let exp: i32 = exp.parse().map_err(|e| {
                    AppError::BadRequest(anyhow::anyhow!("invalid exponent in {:?}: {}", s, e))
                })?;
                10f64.powi(exp)
            } else {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "unknown quantity suffix {:?} in {:?}",
                    suffix,
                    s
                )));
            }
        }
    };

    Ok(base * multiplier)
}
