//! OSC 1.0 message encoding (int32 arguments only)

/// Strings are NUL-terminated and padded to a multiple of four bytes
fn push_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    let pad = 4 - (s.len() % 4);
    buf.extend(std::iter::repeat(0u8).take(pad));
}

/// `address ,i value` with the value big-endian
pub fn encode_int_message(address: &str, value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(address.len() + 12);
    push_padded_str(&mut buf, address);
    push_padded_str(&mut buf, ",i");
    buf.extend_from_slice(&value.to_be_bytes());
    buf
}
