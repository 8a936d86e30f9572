use ft_core::Tensor;

/// Bytes an allocator hands out for a request of `nbytes`.
#[must_use]
pub fn allocation_bytes(nbytes: usize, granularity: usize) -> usize {
    let granularity = granularity.max(1);
    nbytes.div_ceil(granularity).saturating_mul(granularity)
}

/// Bytes read from every input storage plus bytes written to every output
/// storage. Views count the whole storage they address.
pub fn transfer_bytes<'a>(
    inputs: impl IntoIterator<Item = &'a Tensor>,
    outputs: impl IntoIterator<Item = &'a Tensor>,
    granularity: usize,
) -> usize {
    inputs
        .into_iter()
        .chain(outputs)
        .map(|tensor| allocation_bytes(tensor.storage_nbytes(), granularity))
        .fold(0usize, usize::saturating_add)
}

/// Milliseconds to move `bytes` at `bandwidth` bytes per second.
#[must_use]
pub fn transfer_time_ms(bytes: usize, bandwidth: f64) -> f64 {
    bytes as f64 / bandwidth * 1e3
}
