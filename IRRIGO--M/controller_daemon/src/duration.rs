//! Human-readable rendering of second counts.

const UNITS: [(&str, u64); 4] = [("day", 86_400), ("hour", 3_600), ("minute", 60), ("second", 1)];

/// Renders `total_seconds` as e.g. `"1 hour, 1 minute, 1 second"`.
///
/// Units are derived by chained floor division; zero-valued units are
/// omitted, and a zero input renders as `"0 seconds"`.
#[must_use]
pub fn format_duration(total_seconds: u64) -> String {
    let mut remaining = total_seconds;
    let mut parts = Vec::with_capacity(UNITS.len());
    for (name, size) in UNITS {
        let count = remaining / size;
        remaining %= size;
        if count > 0 {
            parts.push(render_unit(count, name));
        }
    }
    if parts.is_empty() {
        return render_unit(0, "second");
    }
    parts.join(", ")
}

fn render_unit(count: u64, name: &str) -> String {
    if count == 1 {
        format!("{count} {name}")
    } else {
        format!("{count} {name}s")
    }
}
