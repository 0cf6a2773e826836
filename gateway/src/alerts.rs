use crate::model::Reading;

/// Gateway-side alerting thresholds. Device-originated shock alerts never
/// pass through here; the device already applied its own threshold.
#[derive(Debug, Clone, Copy)]
pub struct AlertLimits {
    pub temperature_max: f64,
    pub shock_max: f64,
}

/// Evaluate a canonical reading against the configured limits.
///
/// Returns human-readable reasons in a fixed order (temperature first, then
/// shock), each naming the observed value and the threshold it crossed. An
/// empty list means no alert.
pub fn evaluate(reading: &Reading, limits: &AlertLimits) -> Vec<String> {
    let mut reasons = Vec::new();

    if reading.temperature > limits.temperature_max {
        reasons.push(format!(
            "temperature {:.2} C exceeds limit {:.2} C",
            reading.temperature, limits.temperature_max
        ));
    }

    if reading.shock_g > limits.shock_max {
        reasons.push(format!(
            "shock {:.2} g exceeds limit {:.2} g",
            reading.shock_g, limits.shock_max
        ));
    }

    reasons
}
