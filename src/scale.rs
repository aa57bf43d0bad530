use crate::domain::ScaleBy;
use crate::frame::Frame;
use crate::stats::{finite_sorted, mean, quantile_sorted, std_dev};

/// Per-feature affine transform fitted across samples.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Fitted {
    center: f64,
    scale: f64,
}

impl Fitted {
    fn apply(self, value: f64) -> f64 {
        (value - self.center) / self.scale
    }
}

fn fit(scaler: ScaleBy, values: &[f64]) -> Option<Fitted> {
    let fitted = match scaler {
        ScaleBy::None => return None,
        ScaleBy::Minmax => {
            let sorted = finite_sorted(values);
            let (min, max) = (*sorted.first()?, *sorted.last()?);
            Fitted {
                center: min,
                scale: max - min,
            }
        }
        ScaleBy::Standard => Fitted {
            center: mean(values)?,
            scale: std_dev(values)?,
        },
        ScaleBy::Robust => {
            let sorted = finite_sorted(values);
            let q1 = quantile_sorted(&sorted, 0.25)?;
            let q3 = quantile_sorted(&sorted, 0.75)?;
            Fitted {
                center: quantile_sorted(&sorted, 0.5)?,
                scale: q3 - q1,
            }
        }
    };
    // A constant feature keeps its offset but is not stretched.
    let scale = if fitted.scale == 0.0 || !fitted.scale.is_finite() {
        1.0
    } else {
        fitted.scale
    };
    Some(Fitted { scale, ..fitted })
}

/// Rescales each feature (row) of a feature x sample table independently
/// across samples. The table is transposed so features become columns, fitted
/// and transformed, then transposed back; the output always has the input's
/// orientation and shape, including for [`ScaleBy::None`].
pub fn scale_features(table: &Frame, scaler: ScaleBy) -> Frame {
    let transposed = table.transpose();
    let scaled = match scaler {
        ScaleBy::None => transposed,
        _ => transposed.map_columns(|feature| match fit(scaler, feature) {
            Some(fitted) => feature.iter().map(|&v| fitted.apply(v)).collect(),
            None => feature.to_vec(),
        }),
    };
    scaled.transpose()
}
