//! Forward-pass building blocks shared by the workloads.

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use optibench_core::{BenchError, BenchResult, Network};

const NORM_EPS: f32 = 1e-5;

pub(crate) fn matrix(value: &ArrayD<f32>) -> BenchResult<ArrayView2<'_, f32>> {
    Ok(value.view().into_dimensionality::<Ix2>()?)
}

pub(crate) fn vector(value: &ArrayD<f32>) -> BenchResult<ArrayView1<'_, f32>> {
    Ok(value.view().into_dimensionality::<Ix1>()?)
}

/// `x @ W^T + b` with the weights of `{prefix}.weight` / `{prefix}.bias`.
pub fn linear(net: &Network, prefix: &str, x: &Array2<f32>) -> BenchResult<Array2<f32>> {
    let weight = net.param(&format!("{prefix}.weight"))?.read();
    let w = matrix(&weight)?;
    if w.ncols() != x.ncols() {
        return Err(BenchError::Config(format!(
            "{prefix}: expected {} input features, got {}",
            w.ncols(),
            x.ncols()
        )));
    }
    let mut out = x.dot(&w.t());
    if let Ok(bias) = net.param(&format!("{prefix}.bias")) {
        let bias = bias.read();
        out += &vector(&bias)?;
    }
    Ok(out)
}

/// Batch norm in inference mode, using the frozen running statistics.
pub fn batch_norm(net: &Network, prefix: &str, x: &Array2<f32>) -> BenchResult<Array2<f32>> {
    let read = |name: &str| -> BenchResult<Array1<f32>> {
        let param = net.param(&format!("{prefix}.{name}"))?.read();
        Ok(vector(&param)?.to_owned())
    };
    let (weight, bias, mean, var) = (read("weight")?, read("bias")?, read("running_mean")?, read("running_var")?);
    let scale = &weight / &var.mapv(|v| (v + NORM_EPS).sqrt());
    Ok((x - &mean) * &scale + &bias)
}

/// Layer norm over the last axis with `{prefix}.weight` / `{prefix}.bias`.
pub fn layer_norm(net: &Network, prefix: &str, x: &Array2<f32>) -> BenchResult<Array2<f32>> {
    let weight = vector(&net.param(&format!("{prefix}.weight"))?.read())?.to_owned();
    let bias = vector(&net.param(&format!("{prefix}.bias"))?.read())?.to_owned();
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let mean = row.mean().unwrap_or(0.0);
        let var = row.fold(0.0_f32, |acc, &v| acc + (v - mean).powi(2)) / row.len().max(1) as f32;
        let inv = 1.0 / (var + NORM_EPS).sqrt();
        row.mapv_inplace(|v| (v - mean) * inv);
    }
    Ok(out * &weight + &bias)
}

/// Rows of `{prefix}.weight` for each token.
pub fn embedding(net: &Network, prefix: &str, tokens: &[usize]) -> BenchResult<Array2<f32>> {
    let weight = net.param(&format!("{prefix}.weight"))?.read();
    let table = matrix(&weight)?;
    if let Some(&bad) = tokens.iter().find(|&&t| t >= table.nrows()) {
        return Err(BenchError::Config(format!("{prefix}: token {bad} outside vocabulary of {}", table.nrows())));
    }
    Ok(table.select(Axis(0), tokens))
}

pub fn sigmoid(x: Array2<f32>) -> Array2<f32> {
    x.mapv_into(|v| 1.0 / (1.0 + (-v).exp()))
}

pub fn relu(x: Array2<f32>) -> Array2<f32> {
    x.mapv_into(|v| v.max(0.0))
}

/// Numerically stable row-wise log-softmax.
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.fold(0.0_f32, |s, &v| s + (v - max).exp()).ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Mean cross-entropy over rows whose target is not `ignore_index`.
///
/// With `label_smoothing = e` the target distribution puts `1 - e` on the
/// true class and spreads `e` uniformly over all classes.
pub fn cross_entropy(
    logits: &Array2<f32>,
    targets: &[usize],
    ignore_index: Option<usize>,
    label_smoothing: f64,
) -> BenchResult<f64> {
    if logits.nrows() != targets.len() {
        return Err(BenchError::Config(format!(
            "{} logit rows for {} targets",
            logits.nrows(),
            targets.len()
        )));
    }
    let classes = logits.ncols();
    let log_probs = log_softmax(logits);
    let mut total = 0.0;
    let mut counted = 0usize;
    for (row, &target) in log_probs.axis_iter(Axis(0)).zip(targets) {
        if Some(target) == ignore_index {
            continue;
        }
        if target >= classes {
            return Err(BenchError::Config(format!("target {target} out of range for {classes} classes")));
        }
        let nll = -f64::from(row[target]);
        let smooth = -row.iter().map(|&v| f64::from(v)).sum::<f64>() / classes as f64;
        total += (1.0 - label_smoothing) * nll + label_smoothing * smooth;
        counted += 1;
    }
    Ok(if counted == 0 { 0.0 } else { total / counted as f64 })
}

/// Fraction of rows whose argmax equals the target.
pub fn accuracy(logits: &Array2<f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = logits
        .axis_iter(Axis(0))
        .zip(targets)
        .filter(|(row, target)| argmax(row) == Some(**target))
        .count();
    correct as f64 / targets.len() as f64
}

fn argmax(row: &ArrayView1<'_, f32>) -> Option<usize> {
    row.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_log_softmax_rows_sum_to_one() {
        let logits = array![[1.0_f32, 2.0, 3.0], [1000.0, 1000.0, 1000.0]];
        let log_probs = log_softmax(&logits);
        for row in log_probs.axis_iter(Axis(0)) {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Array2::<f32>::zeros((2, 4));
        let loss = cross_entropy(&logits, &[0, 3], None, 0.0).unwrap();
        assert!((loss - 4.0_f64.ln()).abs() < 1e-6);
        // Smoothing does not change the loss of a uniform prediction.
        let smoothed = cross_entropy(&logits, &[0, 3], None, 0.1).unwrap();
        assert!((smoothed - loss).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_ignores_padding() {
        let logits = array![[10.0_f32, 0.0], [0.0, 10.0]];
        let all = cross_entropy(&logits, &[0, 0], None, 0.0).unwrap();
        let ignored = cross_entropy(&logits, &[0, 1], Some(1), 0.0).unwrap();
        assert!(ignored < 1e-3);
        assert!(all > ignored);
        assert_eq!(cross_entropy(&logits, &[1, 1], Some(1), 0.1).unwrap(), 0.0);
        assert!(cross_entropy(&logits, &[5, 0], None, 0.0).is_err());
    }

    #[test]
    fn test_accuracy() {
        let logits = array![[0.1_f32, 0.9], [0.8, 0.2], [0.3, 0.7]];
        assert!((accuracy(&logits, &[1, 0, 0]) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_and_batch_norm() {
        let net = Network::builder("net").linear("fc", 2, 3, true).batch_norm("bn", 3).build().unwrap();
        {
            let mut w = net.param("fc.weight").unwrap().write();
            w.fill(1.0);
        }
        let x = array![[1.0_f32, 2.0]];
        let y = linear(&net, "fc", &x).unwrap();
        assert_eq!(y, array![[3.0_f32, 3.0, 3.0]]);
        let normed = batch_norm(&net, "bn", &y).unwrap();
        assert!((normed[[0, 1]] - 3.0).abs() < 1e-3);
        assert!(linear(&net, "fc", &array![[1.0_f32]]).is_err());
    }

    #[test]
    fn test_layer_norm_and_embedding() {
        let net = Network::builder("net").layer_norm("ln", 4).embedding("emb", 3, 4).build().unwrap();
        let normed = layer_norm(&net, "ln", &array![[1.0_f32, 2.0, 3.0, 4.0]]).unwrap();
        assert!(normed.sum().abs() < 1e-5);
        let var: f32 = normed.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);

        let rows = embedding(&net, "emb", &[2, 0, 2]).unwrap();
        assert_eq!(rows.shape(), &[3, 4]);
        assert_eq!(rows.row(0), rows.row(2));
        assert!(embedding(&net, "emb", &[3]).is_err());
    }
}
