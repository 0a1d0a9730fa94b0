use textplots::{Chart, Plot, Shape};

/// Determine the best scale and unit for a given maximum value
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 {
        (1.0, "")
    } else if max_value >= 1e-3 {
        (1e3, "m")
    } else if max_value >= 1e-6 {
        (1e6, "μ")
    } else if max_value >= 1e-9 {
        (1e9, "n")
    } else {
        (1e12, "p")
    }
}

/// Plot per-sample PV read times of a data-logging run.
///
/// # Arguments
/// * `times` - Average seconds spent reading one PV, one entry per sample
/// * `width` - Optional plot width (default: 140)
/// * `height` - Optional plot height (default: 60)
pub fn plot_sample_times(
    times: &[f64],
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if times.is_empty() {
        return Err("Cannot plot empty data".into());
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);

    let min_value = times.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_value = times.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let (scale, unit) = determine_scale(max_value.abs().max(min_value.abs()));

    let frame: Vec<(f32, f32)> = times
        .iter()
        .enumerate()
        .map(|(i, &t)| (i as f32, (t * scale) as f32))
        .collect();

    println!("Average time to sample a Monitor PV");
    println!("X-axis: Sample index | Y-axis: Time [{}s]", unit);
    println!(
        "Range: {} samples | {:.3} to {:.3} {}s",
        times.len(),
        min_value * scale,
        max_value * scale,
        unit
    );
    println!("{}", "─".repeat(width));

    let max_index = (times.len().max(2) - 1) as f32;
    Chart::new(width as u32, height as u32, 0.0, max_index)
        .lineplot(&Shape::Lines(&frame))
        .nice();

    println!("Sample index →");
    Ok(())
}

/// Plot a correction table column against its fitted curve.
///
/// `points` are the table rows, `curve` the fit sampled across the table
/// range.
pub fn plot_fit(
    title: &str,
    points: &[(f64, f64)],
    curve: &[(f64, f64)],
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if points.is_empty() || curve.is_empty() {
        return Err("Cannot plot empty data".into());
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);
    let x_min = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let mut x_max = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    if x_max <= x_min {
        x_max = x_min + 1.0;
    }

    let to_frame = |data: &[(f64, f64)]| -> Vec<(f32, f32)> {
        data.iter().map(|&(x, y)| (x as f32, y as f32)).collect()
    };
    let measured = to_frame(points);
    let fitted = to_frame(curve);

    println!("{}", title);
    println!("Points: table data | Line: fit");
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, x_min as f32, x_max as f32)
        .lineplot(&Shape::Points(&measured))
        .lineplot(&Shape::Lines(&fitted))
        .nice();

    Ok(())
}
