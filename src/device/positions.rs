use crate::error::ScanError;
use log::warn;
use rand::seq::SliceRandom;

/// Upper bound on the points of one sweep.
pub const MAX_STEPS: usize = 100_000;

/// Validate a configured step count: a whole number from 2 to [`MAX_STEPS`].
pub fn checked_step_count(value: f64, what: &str) -> Result<usize, ScanError> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(ScanError::Config(format!(
            "{} must be a whole number, got {}",
            what, value
        )));
    }
    if value < 2.0 || value > MAX_STEPS as f64 {
        return Err(ScanError::Config(format!(
            "{} must be between 2 and {}, got {}",
            what, MAX_STEPS, value
        )));
    }
    Ok(value as usize)
}

/// Evenly spaced positions from `start` to `stop` inclusive.
///
/// The last element is exactly `stop`, so restoring the endpoint does not
/// depend on accumulated rounding.
pub fn linear_positions(start: f64, stop: f64, step_count: usize) -> Result<Vec<f64>, ScanError> {
    if !(2..=MAX_STEPS).contains(&step_count) {
        return Err(ScanError::Config(format!(
            "step count must be between 2 and {}, got {}",
            MAX_STEPS, step_count
        )));
    }
    let step = (stop - start) / (step_count - 1) as f64;
    Ok((0..step_count)
        .map(|i| {
            if i == step_count - 1 {
                stop
            } else {
                start + i as f64 * step
            }
        })
        .collect())
}

/// Inclusive float range that walks towards `stop` whatever the sign of `step`.
pub fn frange(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, ScanError> {
    let step = step.abs();
    if stop == start {
        return Ok(vec![start]);
    }
    if step == 0.0 || !step.is_finite() {
        return Err(ScanError::Config(format!(
            "invalid range step {} for {}:{}",
            step, start, stop
        )));
    }

    let direction = if stop > start { 1.0 } else { -1.0 };
    let span = (stop - start).abs();
    let eps = step * 1e-9;
    let mut values = Vec::new();
    let mut k = 0usize;
    loop {
        let offset = k as f64 * step;
        if offset > span + eps {
            break;
        }
        values.push(start + direction * offset);
        k += 1;
    }
    Ok(values)
}

/// Parse an explicit position list in scan order.
///
/// Entries are separated by commas, semicolons or whitespace. An entry of
/// the form `start:step:stop` expands to an inclusive range. Entries that
/// are not numbers are skipped with a warning.
pub fn parse_position_list(text: &str) -> Result<Vec<f64>, ScanError> {
    let mut values = Vec::new();
    for token in text
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() == 3 {
            let numbers: Option<Vec<f64>> = parts.iter().map(|p| p.parse::<f64>().ok()).collect();
            match numbers {
                Some(n) => values.extend(frange(n[0], n[2], n[1])?),
                None => warn!("Skipping invalid range {:?}", token),
            }
        } else {
            match token.parse::<f64>() {
                Ok(v) if v.is_finite() => values.push(v),
                _ => warn!("Skipping non-numeric position {:?}", token),
            }
        }
    }
    Ok(values)
}

/// Parse a position list and shuffle it once.
pub fn shuffled_positions(text: &str) -> Result<Vec<f64>, ScanError> {
    let mut values = parse_position_list(text)?;
    if values.is_empty() {
        return Err(ScanError::Config(format!(
            "random scan list {:?} contains no positions",
            text
        )));
    }
    values.shuffle(&mut rand::thread_rng());
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_positions_endpoints_and_spacing() {
        for n in 2..12 {
            let positions = linear_positions(-1.5, 3.7, n).unwrap();
            assert_eq!(positions.len(), n);
            assert_eq!(positions[0], -1.5);
            assert_eq!(positions[n - 1], 3.7);
            let step = (3.7 - -1.5) / (n - 1) as f64;
            for pair in positions.windows(2) {
                assert!((pair[1] - pair[0] - step).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_linear_positions_rejects_single_step() {
        assert!(linear_positions(0.0, 1.0, 1).is_err());
        assert!(linear_positions(0.0, 1.0, 0).is_err());
    }

    #[test]
    fn test_checked_step_count() {
        assert_eq!(checked_step_count(3.0, "NSTEPS").unwrap(), 3);
        assert!(checked_step_count(2.9, "NSTEPS").is_err());
        assert!(checked_step_count(f64::NAN, "NSTEPS").is_err());
        assert!(checked_step_count((MAX_STEPS + 1) as f64, "NSTEPS").is_err());
        assert!(linear_positions(0.0, 1.0, MAX_STEPS + 1).is_err());
    }

    #[test]
    fn test_range_and_value_list() {
        let mut values = parse_position_list("1:0.5:2, 5").unwrap();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![1.0, 1.5, 2.0, 5.0]);
    }

    #[test]
    fn test_descending_range_and_separators() {
        let values = parse_position_list("3:1:1;  7\t8,x").unwrap();
        assert_eq!(values, vec![3.0, 2.0, 1.0, 7.0, 8.0]);
    }

    #[test]
    fn test_frange_rejects_zero_step() {
        assert!(frange(0.0, 1.0, 0.0).is_err());
        assert_eq!(frange(2.0, 2.0, 0.0).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_shuffle_keeps_values() {
        let mut values = shuffled_positions("0:1:9").unwrap();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, (0..10).map(|i| i as f64).collect::<Vec<_>>());
        assert!(shuffled_positions("a b").is_err());
    }
}
