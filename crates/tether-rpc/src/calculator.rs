//! The calculator Provider served by `tether-rpc serve`.
//!
//! ```text
//! plus(x, y)  minus(x, y)  multiplies(x, y)  divides(x, y)
//! scientific.pow(x, y)  scientific.sqrt(x)  scientific.log(x, base)
//! statistics.mean(values)  statistics.stdev(values)
//! ```

use tether::{Provider, RemoteError};

fn range_error(message: impl Into<String>) -> RemoteError {
    RemoteError::new("RangeError", message)
}

pub fn provider() -> Provider {
    Provider::new()
        .sync_method("plus", |(x, y): (f64, f64)| Ok(x + y))
        .sync_method("minus", |(x, y): (f64, f64)| Ok(x - y))
        .sync_method("multiplies", |(x, y): (f64, f64)| Ok(x * y))
        .sync_method("divides", |(x, y): (f64, f64)| {
            if y == 0.0 {
                return Err(RemoteError::error("Divided by zero."));
            }
            Ok(x / y)
        })
        .object("scientific", scientific())
        .object("statistics", statistics())
}

fn scientific() -> Provider {
    Provider::new()
        .sync_method("pow", |(x, y): (f64, f64)| Ok(x.powf(y)))
        .sync_method("sqrt", |(x,): (f64,)| {
            if x < 0.0 {
                return Err(range_error("cannot take the square root of a negative number"));
            }
            Ok(x.sqrt())
        })
        .sync_method("log", |(x, base): (f64, f64)| {
            if x <= 0.0 || base <= 0.0 || base == 1.0 {
                return Err(range_error("logarithm is undefined for these arguments"));
            }
            Ok(x.log(base))
        })
}

fn statistics() -> Provider {
    Provider::new()
        .sync_method("mean", |(values,): (Vec<f64>,)| mean(&values))
        .sync_method("stdev", |(values,): (Vec<f64>,)| {
            let mean = mean(&values)?;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            Ok(variance.sqrt())
        })
}

fn mean(values: &[f64]) -> Result<f64, RemoteError> {
    if values.is_empty() {
        return Err(range_error("no values given"));
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}
