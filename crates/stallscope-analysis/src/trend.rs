//! Direction, change rate and outliers of a short numeric series.

use facet::Facet;

/// Relative change below which a series counts as stable, in percent.
const STABLE_BAND_PCT: f64 = 10.0;
/// Relative change above which an oscillating series still has a direction.
const STRONG_CHANGE_PCT: f64 = 20.0;
const ANOMALY_Z_SCORE: f64 = 2.0;

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    Oscillating,
    Unknown,
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Drop,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct Anomaly {
    pub index: usize,
    pub kind: AnomalyKind,
    pub value: f64,
    pub mean: f64,
    pub z_score: f64,
}

impl Anomaly {
    pub fn is_severe(&self) -> bool {
        self.z_score > 3.0
    }

    pub fn describe(&self) -> String {
        format!(
            "Value {:.2} is {:.2} standard deviations from mean {:.2}",
            self.value, self.z_score, self.mean
        )
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct Trend {
    pub direction: TrendDirection,
    /// Percent change from first to last value. `None` when the series grows
    /// from zero, where the relative change is unbounded.
    #[facet(skip_unless_truthy)]
    pub change_pct: Option<f64>,
    pub values: Vec<f64>,
    #[facet(default)]
    pub anomalies: Vec<Anomaly>,
}

impl Trend {
    pub fn of(values: &[f64]) -> Self {
        match values {
            [] => Self {
                direction: TrendDirection::Unknown,
                change_pct: Some(0.0),
                values: Vec::new(),
                anomalies: Vec::new(),
            },
            [single] => Self {
                direction: TrendDirection::Stable,
                change_pct: Some(0.0),
                values: vec![*single],
                anomalies: Vec::new(),
            },
            _ => Self {
                direction: direction(values),
                change_pct: change_pct(values),
                values: values.to_vec(),
                anomalies: anomalies(values),
            },
        }
    }

    /// Change rate in percent; `+inf` when growing from zero.
    pub fn change_rate(&self) -> f64 {
        self.change_pct.unwrap_or(f64::INFINITY)
    }

    pub fn is_increasing(&self) -> bool {
        self.direction == TrendDirection::Increasing
    }

    pub fn is_decreasing(&self) -> bool {
        self.direction == TrendDirection::Decreasing
    }

    pub fn is_stable(&self) -> bool {
        self.direction == TrendDirection::Stable
    }

    pub fn change_display(&self) -> String {
        match self.change_pct {
            None => "∞ ↑".to_string(),
            Some(pct) if pct > 0.0 => format!("+{pct:.1}% ↑"),
            Some(pct) if pct < 0.0 => format!("{pct:.1}% ↓"),
            Some(_) => "→".to_string(),
        }
    }
}

fn percent_change(first: f64, last: f64) -> f64 {
    if first == 0.0 {
        0.0
    } else {
        (last - first) / first.abs() * 100.0
    }
}

fn direction(values: &[f64]) -> TrendDirection {
    let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
        return TrendDirection::Unknown;
    };
    let pct = percent_change(first, last);
    if pct.abs() < STABLE_BAND_PCT {
        return TrendDirection::Stable;
    }

    let mut increases = 0usize;
    let mut decreases = 0usize;
    for w in values.windows(2) {
        if w[1] > w[0] {
            increases += 1;
        } else if w[1] < w[0] {
            decreases += 1;
        }
    }

    if increases as f64 > decreases as f64 * 1.5 {
        TrendDirection::Increasing
    } else if decreases as f64 > increases as f64 * 1.5 {
        TrendDirection::Decreasing
    } else if pct.abs() > STRONG_CHANGE_PCT {
        if last > first {
            TrendDirection::Increasing
        } else {
            TrendDirection::Decreasing
        }
    } else {
        TrendDirection::Oscillating
    }
}

fn change_pct(values: &[f64]) -> Option<f64> {
    let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
        return Some(0.0);
    };
    if first == 0.0 {
        return if last > 0.0 { None } else { Some(0.0) };
    }
    Some((last - first) / first.abs() * 100.0)
}

/// Values more than two population standard deviations from the mean.
/// Needs at least three values.
fn anomalies(values: &[f64]) -> Vec<Anomaly> {
    if values.len() < 3 {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std_dev = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std_dev == 0.0 {
        return Vec::new();
    }
    values
        .iter()
        .enumerate()
        .filter_map(|(index, &value)| {
            let z_score = ((value - mean) / std_dev).abs();
            (z_score > ANOMALY_Z_SCORE).then(|| Anomaly {
                index,
                kind: if value > mean {
                    AnomalyKind::Spike
                } else {
                    AnomalyKind::Drop
                },
                value,
                mean,
                z_score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_series() {
        assert_eq!(Trend::of(&[]).direction, TrendDirection::Unknown);
        assert_eq!(Trend::of(&[4.0]).direction, TrendDirection::Stable);
        assert_eq!(Trend::of(&[4.0]).change_rate(), 0.0);
    }

    #[test]
    fn small_changes_are_stable() {
        let t = Trend::of(&[100.0, 120.0, 105.0]);
        assert!(t.is_stable());
        assert_eq!(t.change_display(), "+5.0% ↑");
    }

    #[test]
    fn monotonic_series_have_direction() {
        assert!(Trend::of(&[10.0, 20.0, 30.0]).is_increasing());
        assert!(Trend::of(&[30.0, 20.0, 10.0]).is_decreasing());
        assert_eq!(Trend::of(&[10.0, 20.0, 30.0]).change_rate(), 200.0);
    }

    #[test]
    fn oscillation_with_small_net_change() {
        let t = Trend::of(&[100.0, 150.0, 90.0, 140.0, 115.0]);
        assert_eq!(t.direction, TrendDirection::Oscillating);
    }

    #[test]
    fn oscillation_with_large_net_change_keeps_sign() {
        let t = Trend::of(&[100.0, 200.0, 50.0, 180.0, 160.0]);
        assert!(t.is_increasing());
    }

    #[test]
    fn growth_from_zero_is_unbounded() {
        let t = Trend::of(&[0.0, 5.0]);
        assert_eq!(t.change_pct, None);
        assert!(t.change_rate().is_infinite());
        assert_eq!(t.change_display(), "∞ ↑");
        assert_eq!(Trend::of(&[0.0, 0.0]).change_rate(), 0.0);
    }

    #[test]
    fn spike_is_flagged() {
        let t = Trend::of(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 100.0]);
        assert_eq!(t.anomalies.len(), 1);
        assert_eq!(t.anomalies[0].index, 6);
        assert_eq!(t.anomalies[0].kind, AnomalyKind::Spike);
        assert!(Trend::of(&[1.0, 100.0]).anomalies.is_empty());
    }
}
