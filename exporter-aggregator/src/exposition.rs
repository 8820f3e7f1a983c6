//! Rendering of aggregated metrics in the text exposition format.

use std::fmt::Write;

use crate::aggregator::AggregatedResult;

/// Meta metric reporting how many endpoints contributed to a scrape.
pub const SUCCESSFUL_ENDPOINTS_METRIC: &str = "exporter_aggregator_successful_endpoints";

/// Render an aggregated result as exposition text.
///
/// Series are written sorted by identity, followed by the
/// successful-endpoints line.
pub fn render(result: &AggregatedResult) -> String {
    let mut series: Vec<_> = result.metrics().iter().collect();
    series.sort_by(|a, b| a.0.cmp(b.0));

    let mut output = String::with_capacity(series.len() * 64 + 64);

    for (identity, value) in series {
        writeln!(output, "{} {}", identity, format_value(*value)).ok();
    }

    writeln!(
        output,
        "{} {}",
        SUCCESSFUL_ENDPOINTS_METRIC,
        result.successful_endpoints()
    )
    .ok();

    output
}

/// Escape special characters in label values.
pub fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Magnitudes from here on are written in exponent notation.
const EXPONENT_ABOVE: f64 = 1e15;
/// Non-zero magnitudes below this are written in exponent notation.
const EXPONENT_BELOW: f64 = 1e-4;

/// Format a floating point value for the exposition format.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.abs() >= EXPONENT_ABOVE || (value != 0.0 && value.abs() < EXPONENT_BELOW) {
        format!("{:e}", value)
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
