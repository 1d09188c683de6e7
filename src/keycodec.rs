//! Binary key layouts for every index the store maintains.
//!
//! Keys are fixed-width big-endian byte sequences so lexicographic order on
//! the byte string equals numeric order on the encoded ids, which is what
//! lets the KV engine's ordered prefix scan double as an index scan. This
//! module is the single place that knows these layouts; the scan planner
//! and every store module build keys exclusively through these functions —
//! no caller is allowed to fabricate a prefix by hand.
//!
//! ```text
//! SPO            01 | S(8) | P(8) | O(8)            25 bytes
//! OPS            02 | O(8) | P(8) | S(8)             25 bytes
//! PSO            03 | P(8) | S(8) | O(8)             25 bytes
//! SPOG           20 | S(8) | P(8) | O(8) | G(8)      33 bytes
//! POSG           21 | P(8) | O(8) | S(8) | G(8)      33 bytes
//! GSPO           22 | G(8) | S(8) | P(8) | O(8)      33 bytes
//! Content blob   10 | ID(8)                           9 bytes
//! Full vector    11 | ID(8)                           9 bytes
//! Fact count     FF 01                                2 bytes
//! Dict forward   80 | len(2) | utf8                 variable
//! Dict reverse   81 | ID(8)                           9 bytes
//! Dict counter   82                                   1 byte
//! ```
//!
//! The distilled layout table lists content blobs and full vectors under
//! the same `10 | ID(8)` prefix "in a separate namespace" — this engine has
//! one flat keyspace, so the full-vector key is given its own prefix (`11`)
//! to avoid collision; see DESIGN.md.

pub const PREFIX_SPO: u8 = 0x01;
pub const PREFIX_OPS: u8 = 0x02;
pub const PREFIX_PSO: u8 = 0x03;
pub const PREFIX_SPOG: u8 = 0x20;
pub const PREFIX_POSG: u8 = 0x21;
pub const PREFIX_GSPO: u8 = 0x22;
pub const PREFIX_CONTENT: u8 = 0x10;
pub const PREFIX_FULL_VECTOR: u8 = 0x11;
pub const PREFIX_FACT_COUNT: [u8; 2] = [0xFF, 0x01];
pub const PREFIX_DICT_FWD: u8 = 0x80;
pub const PREFIX_DICT_REV: u8 = 0x81;
pub const PREFIX_DICT_COUNTER: u8 = 0x82;

/// Size in bytes of a complete SPO/OPS/PSO key.
pub const TRIPLE_KEY_SIZE: usize = 25;

/// Size in bytes of a complete SPOG/POSG/GSPO key.
pub const QUAD_KEY_SIZE: usize = 33;

#[inline]
fn push_id(buf: &mut Vec<u8>, id: u64) {
    buf.extend_from_slice(&id.to_be_bytes());
}

#[inline]
fn read_id(bytes: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(bytes);
    u64::from_be_bytes(a)
}

/// A fully decoded SPO/OPS/PSO key, in subject/predicate/object order
/// regardless of which index it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripleIds {
    pub s: u64,
    pub p: u64,
    pub o: u64,
}

/// Build the full 25-byte SPO key.
pub fn encode_spo(s: u64, p: u64, o: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRIPLE_KEY_SIZE);
    buf.push(PREFIX_SPO);
    push_id(&mut buf, s);
    push_id(&mut buf, p);
    push_id(&mut buf, o);
    buf
}

/// Build the full 25-byte OPS key.
pub fn encode_ops(o: u64, p: u64, s: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRIPLE_KEY_SIZE);
    buf.push(PREFIX_OPS);
    push_id(&mut buf, o);
    push_id(&mut buf, p);
    push_id(&mut buf, s);
    buf
}

/// Build the full 25-byte PSO key.
pub fn encode_pso(p: u64, s: u64, o: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRIPLE_KEY_SIZE);
    buf.push(PREFIX_PSO);
    push_id(&mut buf, p);
    push_id(&mut buf, s);
    push_id(&mut buf, o);
    buf
}

/// Decode a 25-byte SPO key into ids, in (s, p, o) order.
pub fn decode_spo(key: &[u8]) -> Option<TripleIds> {
    if key.len() != TRIPLE_KEY_SIZE || key[0] != PREFIX_SPO {
        return None;
    }
    Some(TripleIds {
        s: read_id(&key[1..9]),
        p: read_id(&key[9..17]),
        o: read_id(&key[17..25]),
    })
}

/// Decode a 25-byte OPS key into ids, in (s, p, o) order.
pub fn decode_ops(key: &[u8]) -> Option<TripleIds> {
    if key.len() != TRIPLE_KEY_SIZE || key[0] != PREFIX_OPS {
        return None;
    }
    Some(TripleIds {
        o: read_id(&key[1..9]),
        p: read_id(&key[9..17]),
        s: read_id(&key[17..25]),
    })
}

/// Decode a 25-byte PSO key into ids, in (s, p, o) order.
pub fn decode_pso(key: &[u8]) -> Option<TripleIds> {
    if key.len() != TRIPLE_KEY_SIZE || key[0] != PREFIX_PSO {
        return None;
    }
    Some(TripleIds {
        p: read_id(&key[1..9]),
        s: read_id(&key[9..17]),
        o: read_id(&key[17..25]),
    })
}

/// Build an SPO-family prefix from whichever leading components are bound.
/// `p` is only honored when `s` is also bound (it would otherwise produce a
/// discontiguous prefix); the planner is the only caller and it upholds
/// that contract.
pub fn encode_spo_prefix(s: Option<u64>, p: Option<u64>) -> Vec<u8> {
    let mut buf = vec![PREFIX_SPO];
    let Some(s) = s else { return buf };
    push_id(&mut buf, s);
    if let Some(p) = p {
        push_id(&mut buf, p);
    }
    buf
}

/// Build an OPS-family prefix from whichever leading components are bound.
pub fn encode_ops_prefix(o: Option<u64>, p: Option<u64>) -> Vec<u8> {
    let mut buf = vec![PREFIX_OPS];
    let Some(o) = o else { return buf };
    push_id(&mut buf, o);
    if let Some(p) = p {
        push_id(&mut buf, p);
    }
    buf
}

/// Build a PSO-family prefix from the bound predicate.
pub fn encode_pso_prefix(p: Option<u64>) -> Vec<u8> {
    let mut buf = vec![PREFIX_PSO];
    if let Some(p) = p {
        push_id(&mut buf, p);
    }
    buf
}

/// A fully decoded quad key (SPOG/POSG/GSPO), normalized to (s, p, o, g).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadIds {
    pub s: u64,
    pub p: u64,
    pub o: u64,
    pub g: u64,
}

pub fn encode_spog(s: u64, p: u64, o: u64, g: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(QUAD_KEY_SIZE);
    buf.push(PREFIX_SPOG);
    push_id(&mut buf, s);
    push_id(&mut buf, p);
    push_id(&mut buf, o);
    push_id(&mut buf, g);
    buf
}

pub fn encode_posg(p: u64, o: u64, s: u64, g: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(QUAD_KEY_SIZE);
    buf.push(PREFIX_POSG);
    push_id(&mut buf, p);
    push_id(&mut buf, o);
    push_id(&mut buf, s);
    push_id(&mut buf, g);
    buf
}

pub fn encode_gspo(g: u64, s: u64, p: u64, o: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(QUAD_KEY_SIZE);
    buf.push(PREFIX_GSPO);
    push_id(&mut buf, g);
    push_id(&mut buf, s);
    push_id(&mut buf, p);
    push_id(&mut buf, o);
    buf
}

pub fn decode_spog(key: &[u8]) -> Option<QuadIds> {
    if key.len() != QUAD_KEY_SIZE || key[0] != PREFIX_SPOG {
        return None;
    }
    Some(QuadIds {
        s: read_id(&key[1..9]),
        p: read_id(&key[9..17]),
        o: read_id(&key[17..25]),
        g: read_id(&key[25..33]),
    })
}

/// Content blob key: `10 | ID(8)`.
pub fn encode_content_key(id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(PREFIX_CONTENT);
    push_id(&mut buf, id);
    buf
}

/// Full (uncompressed) vector key: `11 | ID(8)`.
pub fn encode_full_vector_key(id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(PREFIX_FULL_VECTOR);
    push_id(&mut buf, id);
    buf
}

/// Persisted fact counter key: `FF 01`.
pub fn encode_fact_count_key() -> Vec<u8> {
    PREFIX_FACT_COUNT.to_vec()
}

/// Dictionary forward key: `80 | len(2) | utf8`.
pub fn encode_dict_fwd_key(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut buf = Vec::with_capacity(3 + bytes.len());
    buf.push(PREFIX_DICT_FWD);
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Dictionary reverse key: `81 | ID(8)`.
pub fn encode_dict_rev_key(id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(PREFIX_DICT_REV);
    push_id(&mut buf, id);
    buf
}

/// Dictionary allocator's persisted `global_max` counter key: `82`.
pub fn encode_dict_counter_key() -> Vec<u8> {
    vec![PREFIX_DICT_COUNTER]
}

/// Fact metadata value encoding: `01 | f64_be(weight) | utf8(source)`.
/// Absence of a value means `weight = 1.0, source = ""`.
pub fn encode_fact_metadata(weight: f64, source: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + source.len());
    buf.push(0x01);
    buf.extend_from_slice(&weight.to_be_bytes());
    buf.extend_from_slice(source.as_bytes());
    buf
}

pub fn decode_fact_metadata(bytes: &[u8]) -> Option<(f64, String)> {
    if bytes.len() < 9 || bytes[0] != 0x01 {
        return None;
    }
    let mut w = [0u8; 8];
    w.copy_from_slice(&bytes[1..9]);
    let weight = f64::from_be_bytes(w);
    let source = String::from_utf8_lossy(&bytes[9..]).into_owned();
    Some((weight, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spo_round_trips() {
        let key = encode_spo(1, 2, 3);
        assert_eq!(key.len(), TRIPLE_KEY_SIZE);
        let ids = decode_spo(&key).unwrap();
        assert_eq!(ids, TripleIds { s: 1, p: 2, o: 3 });
    }

    #[test]
    fn ops_round_trips_to_spo_order() {
        let key = encode_ops(3, 2, 1);
        let ids = decode_ops(&key).unwrap();
        assert_eq!(ids, TripleIds { s: 1, p: 2, o: 3 });
    }

    #[test]
    fn pso_round_trips_to_spo_order() {
        let key = encode_pso(2, 1, 3);
        let ids = decode_pso(&key).unwrap();
        assert_eq!(ids, TripleIds { s: 1, p: 2, o: 3 });
    }

    #[test]
    fn prefixes_have_expected_lengths() {
        assert_eq!(encode_spo_prefix(None, None).len(), 1);
        assert_eq!(encode_spo_prefix(Some(1), None).len(), 9);
        assert_eq!(encode_spo_prefix(Some(1), Some(2)).len(), 17);
        assert_eq!(encode_pso_prefix(Some(1)).len(), 9);
    }

    #[test]
    fn lexicographic_order_matches_numeric_order() {
        let a = encode_spo(1, 0, 0);
        let b = encode_spo(2, 0, 0);
        assert!(a < b);
        let a = encode_spo(1, 5, 0);
        let b = encode_spo(1, 10, 0);
        assert!(a < b);
    }

    #[test]
    fn rejects_wrong_length_or_prefix() {
        assert!(decode_spo(&[0x01, 0, 0]).is_none());
        let ops_key = encode_ops(1, 2, 3);
        assert!(decode_spo(&ops_key).is_none());
    }

    #[test]
    fn quad_key_round_trip() {
        let key = encode_spog(1, 2, 3, 4);
        assert_eq!(key.len(), QUAD_KEY_SIZE);
        let ids = decode_spog(&key).unwrap();
        assert_eq!(
            ids,
            QuadIds {
                s: 1,
                p: 2,
                o: 3,
                g: 4
            }
        );
    }

    #[test]
    fn fact_metadata_round_trips() {
        let bytes = encode_fact_metadata(0.5, "extractor-v2");
        let (w, s) = decode_fact_metadata(&bytes).unwrap();
        assert_eq!(w, 0.5);
        assert_eq!(s, "extractor-v2");
    }

    #[test]
    fn dict_keys_are_distinguishable() {
        let fwd = encode_dict_fwd_key("hello");
        let rev = encode_dict_rev_key(42);
        assert_eq!(fwd[0], PREFIX_DICT_FWD);
        assert_eq!(rev[0], PREFIX_DICT_REV);
        assert_eq!(rev.len(), 9);
    }
}
