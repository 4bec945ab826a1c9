//! Opaque-value query parameters.
//!
//! Values are carried as pre-serialized `[bytes]` blobs rather than typed
//! Rust values; this crate never interprets them itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Consistency;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryFlags(pub u8);

impl QueryFlags {
    pub const VALUES: QueryFlags = QueryFlags(0x01);
    pub const SKIP_METADATA: QueryFlags = QueryFlags(0x02);
    pub const PAGE_SIZE: QueryFlags = QueryFlags(0x04);
    pub const PAGING_STATE: QueryFlags = QueryFlags(0x08);
    pub const SERIAL_CONSISTENCY: QueryFlags = QueryFlags(0x10);
    pub const DEFAULT_TIMESTAMP: QueryFlags = QueryFlags(0x20);
    pub const NAMES_FOR_VALUES: QueryFlags = QueryFlags(0x40);

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn union(self, other: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | other.0)
    }
}

/// One parameter value. `Unset` distinguishes "bound to NULL" from "left
/// unset", matching protocol v4+ semantics (`ParameterUnset` is raised if an
/// unset value is used where the server requires one to be bound).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryValue {
    Set(Bytes),
    Null,
    Unset,
}

/// The bindable parameters of a `QUERY`/`EXECUTE` request.
///
/// This is the part of the wire protocol this crate actually constructs;
/// everything past "here are some opaque value bytes at this consistency
/// level" belongs to the CQL codec layer this crate doesn't implement.
#[derive(Clone, Debug)]
pub struct QueryParams {
    pub consistency: Consistency,
    pub values: Vec<QueryValue>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<Consistency>,
    pub default_timestamp: Option<i64>,
}

impl QueryParams {
    pub fn new(consistency: Consistency) -> Self {
        Self {
            consistency,
            values: Vec::new(),
            skip_metadata: false,
            page_size: None,
            paging_state: None,
            serial_consistency: None,
            default_timestamp: None,
        }
    }

    fn flags(&self) -> QueryFlags {
        let mut flags = QueryFlags::default();
        if !self.values.is_empty() {
            flags = flags.union(QueryFlags::VALUES);
        }
        if self.skip_metadata {
            flags = flags.union(QueryFlags::SKIP_METADATA);
        }
        if self.page_size.is_some() {
            flags = flags.union(QueryFlags::PAGE_SIZE);
        }
        if self.paging_state.is_some() {
            flags = flags.union(QueryFlags::PAGING_STATE);
        }
        if self.serial_consistency.is_some() {
            flags = flags.union(QueryFlags::SERIAL_CONSISTENCY);
        }
        if self.default_timestamp.is_some() {
            flags = flags.union(QueryFlags::DEFAULT_TIMESTAMP);
        }
        flags
    }

    /// Encodes the `<consistency><flags>[<n><value_1>...][<result_page_size>]...`
    /// tail of a QUERY/EXECUTE body (the query/prepared-id string or bytes
    /// that precedes it is the caller's concern).
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.consistency.as_u16());
        let flags = self.flags();
        out.put_u8(flags.0);

        if flags.contains(QueryFlags::VALUES) {
            out.put_u16(self.values.len() as u16);
            for value in &self.values {
                match value {
                    QueryValue::Set(bytes) => {
                        out.put_i32(bytes.len() as i32);
                        out.extend_from_slice(bytes);
                    }
                    QueryValue::Null => out.put_i32(-1),
                    QueryValue::Unset => out.put_i32(-2),
                }
            }
        }
        if let Some(page_size) = self.page_size {
            out.put_i32(page_size);
        }
        if let Some(paging_state) = &self.paging_state {
            out.put_i32(paging_state.len() as i32);
            out.extend_from_slice(paging_state);
        }
        if let Some(serial) = self.serial_consistency {
            out.put_u16(serial.as_u16());
        }
        if let Some(timestamp) = self.default_timestamp {
            out.put_i64(timestamp);
        }
    }

    /// Decodes a tail previously produced by [`QueryParams::encode`]. Used
    /// only by tests to assert the round trip; production code never needs
    /// to decode its own outgoing request.
    #[cfg(test)]
    fn decode(src: &mut Bytes) -> Self {
        let consistency = Consistency::from_u16(src.get_u16()).unwrap();
        let flags = QueryFlags(src.get_u8());
        let mut params = QueryParams::new(consistency);
        params.skip_metadata = flags.contains(QueryFlags::SKIP_METADATA);

        if flags.contains(QueryFlags::VALUES) {
            let count = src.get_u16();
            for _ in 0..count {
                let len = src.get_i32();
                params.values.push(match len {
                    -1 => QueryValue::Null,
                    -2 => QueryValue::Unset,
                    len => QueryValue::Set(src.split_to(len as usize)),
                });
            }
        }
        if flags.contains(QueryFlags::PAGE_SIZE) {
            params.page_size = Some(src.get_i32());
        }
        if flags.contains(QueryFlags::PAGING_STATE) {
            let len = src.get_i32() as usize;
            params.paging_state = Some(src.split_to(len));
        }
        if flags.contains(QueryFlags::SERIAL_CONSISTENCY) {
            params.serial_consistency = Consistency::from_u16(src.get_u16());
        }
        if flags.contains(QueryFlags::DEFAULT_TIMESTAMP) {
            params.default_timestamp = Some(src.get_i64());
        }
        params
    }
}

/// Builds a full `QUERY` body: `<long string><consistency><flags>...`, for
/// any query string plus its bind parameters.
pub fn query_body(query: &str, params: &QueryParams) -> Bytes {
    let mut out = BytesMut::new();
    out.put_i32(query.len() as i32);
    out.extend_from_slice(query.as_bytes());
    params.encode(&mut out);
    out.freeze()
}

/// Builds the body of a `USE <keyspace>` QUERY request, the one fixed query
/// string this crate constructs itself (for keyspace propagation after a
/// session-level `USE` or on newly established connections).
pub fn use_keyspace_body(keyspace: &str, consistency: Consistency) -> Bytes {
    query_body(&format!("USE \"{keyspace}\""), &QueryParams::new(consistency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values_and_optional_fields() {
        let mut params = QueryParams::new(Consistency::LocalQuorum);
        params.values.push(QueryValue::Set(Bytes::from_static(b"abc")));
        params.values.push(QueryValue::Null);
        params.values.push(QueryValue::Unset);
        params.page_size = Some(5000);
        params.paging_state = Some(Bytes::from_static(b"page-token"));
        params.serial_consistency = Some(Consistency::LocalSerial);
        params.default_timestamp = Some(123456789);

        let mut buf = BytesMut::new();
        params.encode(&mut buf);

        let mut frozen = buf.freeze();
        let decoded = QueryParams::decode(&mut frozen);
        assert_eq!(decoded.consistency, Consistency::LocalQuorum);
        assert_eq!(decoded.values, params.values);
        assert_eq!(decoded.page_size, Some(5000));
        assert_eq!(decoded.paging_state.as_deref(), Some(&b"page-token"[..]));
        assert_eq!(decoded.serial_consistency, Some(Consistency::LocalSerial));
        assert_eq!(decoded.default_timestamp, Some(123456789));
    }

    #[test]
    fn use_keyspace_body_contains_the_quoted_keyspace_name() {
        let body = use_keyspace_body("my_ks", Consistency::One);
        assert!(String::from_utf8_lossy(&body).contains("USE \"my_ks\""));
    }
}
