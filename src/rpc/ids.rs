//! Stable 32-bit service and method identifiers.
//!
//! Ids are the first four bytes (little-endian) of SHA-256 over the
//! fully-qualified name, so both peers derive the same id from the
//! interface definition without exchanging a table.

/// Derive the wire id for a service or method name.
pub fn id(name: &str) -> u32 {
    let digest = hmac_sha256::Hash::hash(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Convenience pair for a `(service, method)` name tuple.
pub fn method_ids(service: &str, method: &str) -> (u32, u32) {
    (id(service), id(method))
}
