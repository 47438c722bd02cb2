//! Wire decoding for raw instrumentation samples.
//!
//! The kernel-side programs emit fixed 24-byte little-endian records. The
//! length check happens once per record; fixed-width reads then use
//! unaligned loads to keep decode overhead off the hot path.

use thiserror::Error;

/// Wire sample size in bytes (matches `struct sample` on the BPF side).
pub const SAMPLE_SIZE: usize = 24;

/// Errors that can occur while decoding a sample.
///
/// Decode failures drop the one sample involved; they never affect other
/// samples or the collector itself.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("sample too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown probe id: {raw}")]
    UnknownProbe { raw: u8 },
}

/// A decoded wire record, not yet resolved against the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireSample {
    pub timestamp_ns: u64,
    pub value: u64,
    pub pid: u32,
    pub probe_id: u8,
    /// Label value ordinal (e.g. gc generation); 0 for unlabeled probes.
    pub label: u8,
}

/// Decode a raw record into a [`WireSample`].
pub fn parse_sample(data: &[u8]) -> Result<WireSample, SampleError> {
    if data.len() < SAMPLE_SIZE {
        return Err(SampleError::Truncated { size: data.len() });
    }

    Ok(WireSample {
        timestamp_ns: read_u64_le(data, 0),
        value: read_u64_le(data, 8),
        pid: read_u32_le(data, 16),
        probe_id: read_u8(data, 20),
        label: read_u8(data, 21),
    })
}

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify the record length before fixed-offset reads.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via the upfront check.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

/// Encode a sample into the wire layout. Used by tests and the simulated
/// backend to exercise the same decode path as the kernel backend.
pub fn encode_sample(sample: &WireSample) -> [u8; SAMPLE_SIZE] {
    let mut buf = [0u8; SAMPLE_SIZE];
    buf[0..8].copy_from_slice(&sample.timestamp_ns.to_le_bytes());
    buf[8..16].copy_from_slice(&sample.value.to_le_bytes());
    buf[16..20].copy_from_slice(&sample.pid.to_le_bytes());
    buf[20] = sample.probe_id;
    buf[21] = sample.label;
    buf
}
