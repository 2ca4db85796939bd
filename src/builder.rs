// Serialization of outgoing datagrams. Every response the server sends is a
// flat concatenation of big-endian integers, raw byte strings, and single
// terminator bytes; handlers describe the fields and build_response writes
// them out in order.

/// One field of an outgoing datagram.
#[derive(Debug, PartialEq)]
pub enum Item<'a> {
    U16(u16),
    U8(u8),
    Bytes(&'a [u8]),
}

/// Concatenates the given fields into a wire buffer, integers big-endian.
pub fn build_response(items: &[Item]) -> Vec<u8> {
    let mut buf = Vec::new();
    for item in items {
        match item {
            Item::U16(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Item::U8(v) => buf.push(*v),
            Item::Bytes(b) => buf.extend_from_slice(b),
        }
    }
    buf
}
