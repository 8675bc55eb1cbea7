/// Normalizes a dense tensor shape the way both the updaters and the stores see it.
///
/// Scalars become `[1, 1]`, vectors of length `n` become `[n, 1]` and every other
/// shape is kept as is.
pub fn dense_data_shape(shape: &[usize]) -> Vec<usize> {
    match shape {
        [] => vec![1, 1],
        [n] => vec![*n, 1],
        dims => dims.to_vec(),
    }
}

/// The `(rows, cols)` matrix a dense tensor of `shape` is viewed as during updates.
///
/// The last axis is kept as the columns and every leading axis is folded into the rows.
pub fn matrix_dims(shape: &[usize]) -> (usize, usize) {
    let normalized = dense_data_shape(shape);
    let (last, leading) = normalized.split_last().unwrap_or((&1, &[]));
    (leading.iter().product(), *last)
}

/// The amount of elements of a tensor of `shape`.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
