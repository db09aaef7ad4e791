//! GATT server read path
//!
//! Characteristic values can be longer than one ATT transfer, so remote
//! clients page through them with increasing offsets.

/// Slice of `value` to return for a read at `offset` over a link with the
/// given `mtu`
///
/// Each response carries at most `mtu - 1` bytes (one byte goes to the ATT
/// opcode). Once `offset` reaches the end of the value the response is empty
/// but successful: some client stacks loop forever on an error code here.
pub fn read_slice(value: &[u8], offset: usize, mtu: usize) -> Vec<u8> {
    if offset >= value.len() {
        return Vec::new();
    }
    let remaining = value.len() - offset;
    let chunk = mtu.saturating_sub(1).min(remaining);
    value[offset..offset + chunk].to_vec()
}
