//! Lightning wire primitives used by multi-part payments
//!
//! - BigSize variable-length integers (canonical, big-endian)
//! - Truncated unsigned integers (`tu16`, `tu32`, `tu64`)
//! - TLV records and streams
//! - The final-hop onion payload carrying `payment_data`
//!
//! Decoding is strict about canonical forms: a BigSize that could have been
//! written shorter, or a truncated integer with a leading zero byte, is a
//! hard error rather than something to normalise.

use super::payment::PaymentSecret;
use thiserror::Error;

/// TLV type of `amt_to_forward` in the onion hop payload
pub const AMT_TO_FORWARD_TLV_TYPE: u64 = 2;

/// TLV type of `outgoing_cltv_value` in the onion hop payload
pub const OUTGOING_CLTV_VALUE_TLV_TYPE: u64 = 4;

/// TLV type of `payment_data` (payment secret + total amount)
pub const PAYMENT_DATA_TLV_TYPE: u64 = 8;

const BIG_SIZE_U16_MARKER: u8 = 0xfd;
const BIG_SIZE_U32_MARKER: u8 = 0xfe;
const BIG_SIZE_U64_MARKER: u8 = 0xff;

/// Errors raised while decoding wire bytes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Non-minimal encoding")]
    NonMinimalEncoding,

    #[error("Truncated input: need {needed} bytes, have {available}")]
    TruncatedInput { needed: usize, available: usize },

    #[error("Value out of bounds: {0}")]
    ValueOutOfBounds(String),

    #[error("TLV types not strictly increasing: {current} after {previous}")]
    InvalidOrdering { previous: u64, current: u64 },

    #[error("Unknown even TLV type {0}")]
    UnknownEvenType(u64),

    #[error("Missing required TLV field: {0}")]
    MissingField(&'static str),
}

/// Result type for wire decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

// ============================================================================
// BigSize
// ============================================================================

/// Number of bytes `value` occupies as a BigSize
pub fn big_size_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Append the canonical BigSize encoding of `value`
pub fn write_big_size(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(BIG_SIZE_U16_MARKER);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(BIG_SIZE_U32_MARKER);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(BIG_SIZE_U64_MARKER);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Canonical BigSize encoding of `value`
pub fn encode_big_size(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(big_size_len(value));
    write_big_size(value, &mut out);
    out
}

/// Decode a BigSize from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_big_size(bytes: &[u8]) -> DecodeResult<(u64, usize)> {
    let marker = *bytes.first().ok_or(DecodeError::TruncatedInput {
        needed: 1,
        available: 0,
    })?;

    let (width, minimum) = match marker {
        BIG_SIZE_U16_MARKER => (2, 0xfd),
        BIG_SIZE_U32_MARKER => (4, 0x1_0000),
        BIG_SIZE_U64_MARKER => (8, 0x1_0000_0000),
        n => return Ok((n as u64, 1)),
    };

    let body = bytes
        .get(1..1 + width)
        .ok_or(DecodeError::TruncatedInput {
            needed: 1 + width,
            available: bytes.len(),
        })?;
    let value = body.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);

    if value < minimum {
        return Err(DecodeError::NonMinimalEncoding);
    }
    Ok((value, 1 + width))
}

// ============================================================================
// Truncated integers
// ============================================================================

fn encode_truncated(value: u64) -> Vec<u8> {
    let skip = (value.leading_zeros() / 8) as usize;
    value.to_be_bytes()[skip..].to_vec()
}

fn decode_truncated(bytes: &[u8], width: usize, kind: &str) -> DecodeResult<u64> {
    if bytes.len() > width {
        return Err(DecodeError::ValueOutOfBounds(format!(
            "{} is at most {} bytes, got {}",
            kind,
            width,
            bytes.len()
        )));
    }
    if bytes.first() == Some(&0) {
        return Err(DecodeError::NonMinimalEncoding);
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Shortest big-endian encoding of a `u16` (zero encodes to no bytes)
pub fn encode_tu16(value: u16) -> Vec<u8> {
    encode_truncated(value as u64)
}

/// Shortest big-endian encoding of a `u32`
pub fn encode_tu32(value: u32) -> Vec<u8> {
    encode_truncated(value as u64)
}

/// Shortest big-endian encoding of a `u64`
pub fn encode_tu64(value: u64) -> Vec<u8> {
    encode_truncated(value)
}

pub fn decode_tu16(bytes: &[u8]) -> DecodeResult<u16> {
    decode_truncated(bytes, 2, "tu16").map(|v| v as u16)
}

pub fn decode_tu32(bytes: &[u8]) -> DecodeResult<u32> {
    decode_truncated(bytes, 4, "tu32").map(|v| v as u32)
}

pub fn decode_tu64(bytes: &[u8]) -> DecodeResult<u64> {
    decode_truncated(bytes, 8, "tu64")
}

// ============================================================================
// TLV
// ============================================================================

/// A single type-length-value record. The length is always the value length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    pub record_type: u64,
    pub value: Vec<u8>,
}

impl TlvRecord {
    pub fn new(record_type: u64, value: Vec<u8>) -> Self {
        Self { record_type, value }
    }

    pub fn length(&self) -> u64 {
        self.value.len() as u64
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_big_size(self.record_type, out);
        write_big_size(self.length(), out);
        out.extend_from_slice(&self.value);
    }
}

/// Ordered sequence of TLV records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvStream {
    records: Vec<TlvRecord>,
}

impl TlvStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<TlvRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: TlvRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TlvRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TlvRecord> {
        self.records
    }

    pub fn get(&self, record_type: u64) -> Option<&TlvRecord> {
        self.records.iter().find(|r| r.record_type == record_type)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize, sorting records by ascending type first
    pub fn encode(&self) -> Vec<u8> {
        let mut sorted: Vec<&TlvRecord> = self.records.iter().collect();
        sorted.sort_by_key(|r| r.record_type);

        let mut out = Vec::new();
        for record in sorted {
            record.write(&mut out);
        }
        out
    }

    /// Read `(type, length, value)` triples until the buffer is exhausted.
    ///
    /// Record order is preserved as found; use [`TlvStream::decode_strict`]
    /// where the wire ordering rule must be enforced.
    pub fn decode(bytes: &[u8]) -> DecodeResult<Self> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() {
            let (record_type, consumed) = decode_big_size(&bytes[offset..])?;
            offset += consumed;

            let (length, consumed) = decode_big_size(&bytes[offset..])?;
            offset += consumed;

            let remaining = bytes.len() - offset;
            let length = usize::try_from(length)
                .ok()
                .filter(|l| *l <= remaining)
                .ok_or(DecodeError::TruncatedInput {
                    needed: length.min(usize::MAX as u64) as usize,
                    available: remaining,
                })?;

            records.push(TlvRecord::new(
                record_type,
                bytes[offset..offset + length].to_vec(),
            ));
            offset += length;
        }

        Ok(Self { records })
    }

    /// Decode and require strictly increasing record types
    pub fn decode_strict(bytes: &[u8]) -> DecodeResult<Self> {
        let stream = Self::decode(bytes)?;
        for pair in stream.records.windows(2) {
            if pair[1].record_type <= pair[0].record_type {
                return Err(DecodeError::InvalidOrdering {
                    previous: pair[0].record_type,
                    current: pair[1].record_type,
                });
            }
        }
        Ok(stream)
    }
}

// ============================================================================
// Final-hop payload
// ============================================================================

/// Contents of the `payment_data` TLV: the payment secret and the total
/// amount of the whole multi-part set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentData {
    pub payment_secret: PaymentSecret,
    pub total_msat: u64,
}

impl PaymentData {
    pub fn new(payment_secret: PaymentSecret, total_msat: u64) -> Self {
        Self {
            payment_secret,
            total_msat,
        }
    }

    /// `payment_secret (32 bytes) || tu64(total_msat)`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PaymentSecret::LEN + 8);
        out.extend_from_slice(self.payment_secret.as_bytes());
        out.extend_from_slice(&encode_tu64(self.total_msat));
        out
    }

    pub fn decode(bytes: &[u8]) -> DecodeResult<Self> {
        if bytes.len() < PaymentSecret::LEN {
            return Err(DecodeError::TruncatedInput {
                needed: PaymentSecret::LEN,
                available: bytes.len(),
            });
        }
        let (secret, total) = bytes.split_at(PaymentSecret::LEN);
        let payment_secret = PaymentSecret::try_from(secret)
            .map_err(|e| DecodeError::ValueOutOfBounds(e.to_string()))?;
        Ok(Self {
            payment_secret,
            total_msat: decode_tu64(total)?,
        })
    }

    pub fn to_tlv(&self) -> TlvRecord {
        TlvRecord::new(PAYMENT_DATA_TLV_TYPE, self.encode())
    }
}

/// Build the `payment_data` record for the final hop of an MPP part
pub fn build_payment_data_tlv(payment_secret: PaymentSecret, total_msat: u64) -> TlvRecord {
    PaymentData::new(payment_secret, total_msat).to_tlv()
}

/// Onion payload for the last hop of a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalHopPayload {
    /// Amount this part delivers
    pub amt_to_forward_msat: u64,
    /// CLTV expiry the payee should see
    pub outgoing_cltv_value: u32,
    /// Present on every part of a multi-part payment
    pub payment_data: Option<PaymentData>,
}

impl FinalHopPayload {
    pub fn to_tlv_stream(&self) -> TlvStream {
        let mut stream = TlvStream::new();
        stream.push(TlvRecord::new(
            AMT_TO_FORWARD_TLV_TYPE,
            encode_tu64(self.amt_to_forward_msat),
        ));
        stream.push(TlvRecord::new(
            OUTGOING_CLTV_VALUE_TLV_TYPE,
            encode_tu32(self.outgoing_cltv_value),
        ));
        if let Some(payment_data) = &self.payment_data {
            stream.push(payment_data.to_tlv());
        }
        stream
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_tlv_stream().encode()
    }

    /// Parse a final-hop payload. Unknown odd types are skipped; unknown even
    /// types are rejected.
    pub fn decode(bytes: &[u8]) -> DecodeResult<Self> {
        let stream = TlvStream::decode_strict(bytes)?;

        let mut amt_to_forward_msat = None;
        let mut outgoing_cltv_value = None;
        let mut payment_data = None;

        for record in stream.records() {
            match record.record_type {
                AMT_TO_FORWARD_TLV_TYPE => amt_to_forward_msat = Some(decode_tu64(&record.value)?),
                OUTGOING_CLTV_VALUE_TLV_TYPE => {
                    outgoing_cltv_value = Some(decode_tu32(&record.value)?)
                }
                PAYMENT_DATA_TLV_TYPE => payment_data = Some(PaymentData::decode(&record.value)?),
                t if t % 2 == 0 => return Err(DecodeError::UnknownEvenType(t)),
                _ => {}
            }
        }

        Ok(Self {
            amt_to_forward_msat: amt_to_forward_msat
                .ok_or(DecodeError::MissingField("amt_to_forward"))?,
            outgoing_cltv_value: outgoing_cltv_value
                .ok_or(DecodeError::MissingField("outgoing_cltv_value"))?,
            payment_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_bytes(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_big_size_boundaries() {
        assert_eq!(encode_big_size(0xfc), vec![0xfc]);
        assert_eq!(encode_big_size(0xfd), vec![0xfd, 0x00, 0xfd]);
        assert_eq!(big_size_len(0xffff), 3);
        assert_eq!(big_size_len(0x1_0000), 5);
        assert_eq!(big_size_len(u64::MAX), 9);
    }

    #[test]
    fn test_big_size_reports_consumed_bytes() {
        let (value, consumed) = decode_big_size(&hex_bytes("fe00010000aa")).unwrap();
        assert_eq!(value, 65_536);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_big_size_non_minimal() {
        assert_eq!(
            decode_big_size(&hex_bytes("fd00fc")),
            Err(DecodeError::NonMinimalEncoding)
        );
        assert_eq!(
            decode_big_size(&hex_bytes("fe0000ffff")),
            Err(DecodeError::NonMinimalEncoding)
        );
        assert_eq!(
            decode_big_size(&hex_bytes("ff00000000ffffffff")),
            Err(DecodeError::NonMinimalEncoding)
        );
    }

    #[test]
    fn test_big_size_truncated() {
        assert_eq!(
            decode_big_size(&[]),
            Err(DecodeError::TruncatedInput {
                needed: 1,
                available: 0
            })
        );
        assert_eq!(
            decode_big_size(&hex_bytes("fd00")),
            Err(DecodeError::TruncatedInput {
                needed: 3,
                available: 2
            })
        );
        assert!(matches!(
            decode_big_size(&hex_bytes("ff0000000100")),
            Err(DecodeError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_truncated_integers() {
        assert!(encode_tu64(0).is_empty());
        assert_eq!(encode_tu64(1), vec![0x01]);
        assert_eq!(encode_tu64(256), vec![0x01, 0x00]);
        assert_eq!(encode_tu32(0x0100_0000), vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(encode_tu16(0xffff), vec![0xff, 0xff]);

        assert_eq!(decode_tu64(&[]).unwrap(), 0);
        assert_eq!(decode_tu64(&[0x01, 0x00]).unwrap(), 256);
        assert_eq!(decode_tu16(&[0xff, 0xff]).unwrap(), 0xffff);
    }

    #[test]
    fn test_truncated_integer_rejects_bad_input() {
        assert_eq!(decode_tu16(&[0x00, 0x01]), Err(DecodeError::NonMinimalEncoding));
        assert!(matches!(
            decode_tu32(&[1, 2, 3, 4, 5]),
            Err(DecodeError::ValueOutOfBounds(_))
        ));
    }

    #[test]
    fn test_tlv_encode_sorts_by_type() {
        let stream = TlvStream::from_records(vec![
            TlvRecord::new(5, vec![0xaa]),
            TlvRecord::new(1, vec![]),
        ]);
        assert_eq!(stream.encode(), hex_bytes("01000501aa"));
    }

    #[test]
    fn test_tlv_decode_errors() {
        // Type with no length
        assert!(matches!(
            TlvStream::decode(&hex_bytes("01")),
            Err(DecodeError::TruncatedInput { .. })
        ));
        // Declared length exceeds remaining bytes
        assert_eq!(
            TlvStream::decode(&hex_bytes("0103aabb")),
            Err(DecodeError::TruncatedInput {
                needed: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_tlv_strict_ordering() {
        let bytes = hex_bytes("0201aa0101bb");
        assert!(TlvStream::decode(&bytes).is_ok());
        assert_eq!(
            TlvStream::decode_strict(&bytes),
            Err(DecodeError::InvalidOrdering {
                previous: 2,
                current: 1
            })
        );
        // Duplicate types are not strictly increasing either
        assert!(TlvStream::decode_strict(&hex_bytes("0101aa0101bb")).is_err());
    }

    #[test]
    fn test_payment_data_layout() {
        let secret = PaymentSecret::new([0x11; 32]);
        let record = build_payment_data_tlv(secret, 1_000);

        assert_eq!(record.record_type, PAYMENT_DATA_TLV_TYPE);
        assert_eq!(record.value.len(), 34);
        assert_eq!(&record.value[..32], &[0x11; 32]);
        assert_eq!(&record.value[32..], &[0x03, 0xe8]);

        let decoded = PaymentData::decode(&record.value).unwrap();
        assert_eq!(decoded.payment_secret, secret);
        assert_eq!(decoded.total_msat, 1_000);
    }

    #[test]
    fn test_final_hop_payload() {
        let payload = FinalHopPayload {
            amt_to_forward_msat: 400,
            outgoing_cltv_value: 800_000,
            payment_data: Some(PaymentData::new(PaymentSecret::new([7; 32]), 1_000)),
        };
        let bytes = payload.encode();
        assert_eq!(FinalHopPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_final_hop_payload_type_rules() {
        // amt_to_forward=1, outgoing_cltv=1, unknown odd type 11 is skipped
        let ok = hex_bytes("020101040101");
        let mut with_odd = ok.clone();
        with_odd.extend_from_slice(&hex_bytes("0b00"));
        assert!(FinalHopPayload::decode(&with_odd).is_ok());

        let mut with_even = ok;
        with_even.extend_from_slice(&hex_bytes("0c00"));
        assert_eq!(
            FinalHopPayload::decode(&with_even),
            Err(DecodeError::UnknownEvenType(12))
        );

        assert_eq!(
            FinalHopPayload::decode(&hex_bytes("040101")),
            Err(DecodeError::MissingField("amt_to_forward"))
        );
    }
}
