//! Naive next-close predictor.
//!
//! An ordinary least-squares line through the most recent closes, extended by
//! one bar.

/// Closes used for the fit.
pub const PREDICTION_WINDOW: usize = 20;

/// Predicted next close, or `None` with fewer than two usable closes.
pub fn predict_next(closes: &[f64], window: usize) -> Option<f64> {
    let recent = &closes[closes.len().saturating_sub(window)..];
    if recent.len() < 2 || recent.iter().any(|c| !c.is_finite()) {
        return None;
    }

    let n = recent.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = recent.iter().sum::<f64>() / n;

    let (mut cov, mut var) = (0.0, 0.0);
    for (i, y) in recent.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    let slope = cov / var;
    let intercept = mean_y - slope * mean_x;
    Some(intercept + slope * n)
}

/// (predicted − last) / last; 0.0 when no prediction is possible.
pub fn predicted_delta(closes: &[f64], window: usize) -> f64 {
    let (Some(&last), Some(predicted)) = (closes.last(), predict_next(closes, window)) else {
        return 0.0;
    };
    if last <= 0.0 {
        return 0.0;
    }
    (predicted - last) / last
}
