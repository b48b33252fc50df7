//! Wire formats of the KIS realtime gateway.
//!
//! Three shapes share one socket:
//! - the literal `PINGPONG` keep-alive, which must be echoed back verbatim
//! - realtime batches `marker|tr_id|count|rec^rec^...` (marker '0' or '1'),
//!   each record pipe-delimited in a fixed field layout
//! - JSON envelopes for subscription ACKs and occasional price bodies
//!
//! Legacy-endpoint payloads may arrive EUC-KR encoded, so binary frames go
//! through a tolerant decode. A bad record skips that record, a bad frame
//! drops that frame; neither touches the connection.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::TR_ID_EXECUTION;
use crate::models::PriceUpdate;

/// Keep-alive literal. Echoed exactly, never JSON-wrapped.
pub const PINGPONG: &str = "PINGPONG";

pub const SOURCE_STREAM: &str = "ws_stream";
pub const SOURCE_ENVELOPE: &str = "ws_envelope";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is not pipe data, keep-alive, or JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame is not valid EUC-KR ({len} bytes)")]
    Encoding { len: usize },
}

/// What one inbound frame decoded to.
#[derive(Debug)]
pub enum DecodedFrame {
    /// Keep-alive; the caller echoes [`PINGPONG`] back.
    PingPong,
    /// Normalized price updates from a batch or an envelope body.
    Prices(Vec<PriceUpdate>),
    /// Subscription ACK envelope.
    Ack {
        tr_id: String,
        code: String,
        message: String,
    },
    /// Valid but irrelevant traffic (other tr_ids, notices).
    Ignored,
}

/// Decode one text frame.
pub fn decode_text(text: &str, now: DateTime<Utc>) -> Result<DecodedFrame, WireError> {
    let trimmed = text.trim();
    if trimmed == PINGPONG {
        return Ok(DecodedFrame::PingPong);
    }
    if trimmed.starts_with('0') || trimmed.starts_with('1') {
        return Ok(decode_realtime(trimmed, now));
    }
    decode_envelope(trimmed, now)
}

/// Decode one binary frame. The legacy endpoint ships EUC-KR; ASCII JSON
/// passes through the same path unchanged.
pub fn decode_binary(bytes: &[u8], now: DateTime<Utc>) -> Result<DecodedFrame, WireError> {
    let (text, _, had_errors) = encoding_rs::EUC_KR.decode(bytes);
    if had_errors {
        return Err(WireError::Encoding { len: bytes.len() });
    }
    decode_text(&text, now)
}

/// Signed control envelope for subscribe (`tr_type` "1") and unsubscribe
/// (`tr_type` "0").
pub fn control_message(approval_key: &str, tr_id: &str, tr_key: &str, subscribe: bool) -> String {
    serde_json::json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": if subscribe { "1" } else { "0" },
            "content-type": "utf-8",
        },
        "body": {
            "input": {
                "tr_id": tr_id,
                "tr_key": tr_key,
            }
        }
    })
    .to_string()
}

/// `marker|tr_id|count|rec^rec^...`: only the first three pipes delimit
/// the head, everything after is the record payload.
fn decode_realtime(text: &str, now: DateTime<Utc>) -> DecodedFrame {
    let mut parts = text.splitn(4, '|');
    let _marker = parts.next();
    let tr_id = parts.next().unwrap_or("");
    let declared = parts.next().unwrap_or("");
    let payload = match parts.next() {
        Some(p) => p,
        None => {
            debug!(frame = %text.chars().take(50).collect::<String>(), "truncated realtime frame");
            return DecodedFrame::Ignored;
        }
    };

    if tr_id != TR_ID_EXECUTION {
        debug!(tr_id, "realtime frame for unhandled tr_id");
        return DecodedFrame::Ignored;
    }

    let updates: Vec<PriceUpdate> = payload
        .split('^')
        .filter_map(|record| parse_execution_record(record, now))
        .collect();

    if let Ok(declared_count) = declared.trim().parse::<usize>() {
        if declared_count != updates.len() {
            debug!(
                declared = declared_count,
                decoded = updates.len(),
                "record count mismatch in realtime batch"
            );
        }
    }

    DecodedFrame::Prices(updates)
}

/// One pipe-delimited execution record:
///
/// `[0] symbol  [1] HHMMSS  [2] price  [3] change sign  [4] change amount
///  [5] change rate  [6] open  [7] high  [8] low  [9] acml volume
///  [10] acml trade value  [11] ask  [12] bid`
///
/// Fields 10-12 are optional and default to 0 when absent. A record with
/// fewer than 10 fields, an empty symbol, or a non-numeric numeric field
/// is skipped.
pub fn parse_execution_record(record: &str, now: DateTime<Utc>) -> Option<PriceUpdate> {
    let fields: Vec<&str> = record.split('|').collect();
    if fields.len() < 10 {
        return None;
    }
    let symbol = fields[0].trim();
    if symbol.is_empty() {
        return None;
    }
    Some(PriceUpdate {
        symbol: symbol.to_string(),
        execution_time: Some(fields[1].trim().to_string()),
        price: parse_i64(fields[2])?,
        change_sign: parse_i64(fields[3])? as i32,
        change_amount: parse_i64(fields[4])?,
        change_rate: parse_f64(fields[5])?,
        open: parse_i64(fields[6])?,
        high: parse_i64(fields[7])?,
        low: parse_i64(fields[8])?,
        acml_volume: parse_i64(fields[9])?,
        acml_trade_value: fields.get(10).map_or(Some(0), |s| parse_i64(s))?,
        ask_price: fields.get(11).map_or(Some(0), |s| parse_i64(s))?,
        bid_price: fields.get(12).map_or(Some(0), |s| parse_i64(s))?,
        source: SOURCE_STREAM,
        timestamp: now,
    })
}

fn decode_envelope(text: &str, now: DateTime<Utc>) -> Result<DecodedFrame, WireError> {
    let value: Value = serde_json::from_str(text)?;

    let header_tr_id = value
        .pointer("/header/tr_id")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if header_tr_id == PINGPONG {
        return Ok(DecodedFrame::PingPong);
    }

    let body = match value.get("body") {
        Some(b) if b.is_object() => b,
        _ => return Ok(DecodedFrame::Ignored),
    };

    // ACKs carry a result code; SUBSCRIBE SUCCESS / failure both land here.
    if let Some(code) = body.get("rt_cd").and_then(|v| v.as_str()) {
        return Ok(DecodedFrame::Ack {
            tr_id: header_tr_id.to_string(),
            code: code.to_string(),
            message: body
                .get("msg1")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        });
    }

    if let Some(update) = normalize_envelope_body(body, now) {
        return Ok(DecodedFrame::Prices(vec![update]));
    }

    Ok(DecodedFrame::Ignored)
}

/// Envelope bodies keyed by `tr_key` with `stck_*` price fields normalize
/// into the same shape as stream records; change fields are absent on this
/// path and default to zero.
fn normalize_envelope_body(body: &Value, now: DateTime<Utc>) -> Option<PriceUpdate> {
    let symbol = body.get("tr_key")?.as_str()?.trim();
    if symbol.is_empty() || body.get("stck_prpr").is_none() {
        return None;
    }
    let int_field = |key: &str| -> i64 { body.get(key).map_or(0, json_i64) };
    Some(PriceUpdate {
        symbol: symbol.to_string(),
        execution_time: None,
        price: int_field("stck_prpr"),
        change_sign: 0,
        change_amount: 0,
        change_rate: 0.0,
        open: int_field("stck_oprc"),
        high: int_field("stck_hgpr"),
        low: int_field("stck_lwpr"),
        acml_volume: int_field("acml_vol"),
        acml_trade_value: int_field("acml_tr_pbut"),
        ask_price: int_field("askp"),
        bid_price: int_field("bidp"),
        source: SOURCE_ENVELOPE,
        timestamp: now,
    })
}

/// Numbers arrive as JSON strings on this gateway; accept either.
fn json_i64(v: &Value) -> i64 {
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
}

/// Empty fields mean zero; anything else must parse.
fn parse_i64(s: &str) -> Option<i64> {
    let t = s.trim();
    if t.is_empty() {
        return Some(0);
    }
    t.parse().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return Some(0.0);
    }
    t.parse().ok()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const REC_SAMSUNG: &str =
        "005930|093015|70200|2|300|0.43|70100|70500|70000|123456|8640000000|70250|70150";
    const REC_HYNIX: &str =
        "000660|093016|85000|5|500|0.59|84800|85300|84600|654321|5550000000|85050|84950";

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_pingpong_literal() {
        assert!(matches!(
            decode_text("PINGPONG", now()).unwrap(),
            DecodedFrame::PingPong
        ));
    }

    #[test]
    fn test_two_record_batch_decodes_both() {
        let frame = format!("0|H0STCNT0|2|{}^{}", REC_SAMSUNG, REC_HYNIX);
        let decoded = decode_text(&frame, now()).unwrap();
        let updates = match decoded {
            DecodedFrame::Prices(u) => u,
            other => panic!("expected prices, got {:?}", other),
        };
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].symbol, "005930");
        assert_eq!(updates[0].price, 70200);
        assert_eq!(updates[0].execution_time.as_deref(), Some("093015"));
        assert_eq!(updates[0].acml_volume, 123_456);
        assert_eq!(updates[1].symbol, "000660");
        assert_eq!(updates[1].price, 85000);
        assert_eq!(updates[1].execution_time.as_deref(), Some("093016"));
        assert_eq!(updates[1].bid_price, 84950);
    }

    #[test]
    fn test_malformed_record_skips_only_itself() {
        let frame = format!("0|H0STCNT0|3|{}^junk|too|short^{}", REC_SAMSUNG, REC_HYNIX);
        let decoded = decode_text(&frame, now()).unwrap();
        match decoded {
            DecodedFrame::Prices(updates) => {
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].symbol, "005930");
                assert_eq!(updates[1].symbol, "000660");
            }
            other => panic!("expected prices, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_price_skips_record() {
        let bad = "005930|093015|abc|2|300|0.43|70100|70500|70000|123456";
        assert!(parse_execution_record(bad, now()).is_none());
    }

    #[test]
    fn test_empty_numeric_fields_parse_as_zero() {
        let rec = "005930|093015|70200|2||0.43|70100|70500|70000|";
        let update = parse_execution_record(rec, now()).unwrap();
        assert_eq!(update.change_amount, 0);
        assert_eq!(update.acml_volume, 0);
        assert_eq!(update.acml_trade_value, 0);
        assert_eq!(update.ask_price, 0);
    }

    #[test]
    fn test_record_needs_ten_fields() {
        let nine = "005930|093015|70200|2|300|0.43|70100|70500|70000";
        assert!(parse_execution_record(nine, now()).is_none());
        let ten = "005930|093015|70200|2|300|0.43|70100|70500|70000|123";
        assert!(parse_execution_record(ten, now()).is_some());
    }

    #[test]
    fn test_truncated_frame_is_ignored() {
        assert!(matches!(
            decode_text("0|H0STCNT0", now()).unwrap(),
            DecodedFrame::Ignored
        ));
    }

    #[test]
    fn test_other_tr_id_is_ignored() {
        let frame = format!("1|H0STASP0|1|{}", REC_SAMSUNG);
        assert!(matches!(
            decode_text(&frame, now()).unwrap(),
            DecodedFrame::Ignored
        ));
    }

    #[test]
    fn test_ack_envelope() {
        let frame = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930"},"body":{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"}}"#;
        match decode_text(frame, now()).unwrap() {
            DecodedFrame::Ack {
                tr_id,
                code,
                message,
            } => {
                assert_eq!(tr_id, "H0STCNT0");
                assert_eq!(code, "0");
                assert_eq!(message, "SUBSCRIBE SUCCESS");
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_json_pingpong_header() {
        let frame = r#"{"header":{"tr_id":"PINGPONG","datetime":"20240315093015"}}"#;
        assert!(matches!(
            decode_text(frame, now()).unwrap(),
            DecodedFrame::PingPong
        ));
    }

    #[test]
    fn test_envelope_price_normalization() {
        let frame = r#"{"header":{"tr_id":"H0STCNT0"},"body":{"tr_key":"005930","stck_prpr":"70200","stck_oprc":"70100","stck_hgpr":"70500","stck_lwpr":"70000","acml_vol":"123456","askp":"70250","bidp":"70150"}}"#;
        match decode_text(frame, now()).unwrap() {
            DecodedFrame::Prices(updates) => {
                assert_eq!(updates.len(), 1);
                let u = &updates[0];
                assert_eq!(u.symbol, "005930");
                assert_eq!(u.price, 70200);
                assert_eq!(u.open, 70100);
                assert_eq!(u.ask_price, 70250);
                assert_eq!(u.execution_time, None);
                assert_eq!(u.source, SOURCE_ENVELOPE);
                assert_eq!(u.change_amount, 0);
            }
            other => panic!("expected prices, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_without_price_fields_is_ignored() {
        let frame = r#"{"header":{"tr_id":"H0STCNT0"},"body":{"tr_key":"005930","note":"no prices here"}}"#;
        assert!(matches!(
            decode_text(frame, now()).unwrap(),
            DecodedFrame::Ignored
        ));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(decode_text("not a frame at all", now()).is_err());
    }

    #[test]
    fn test_binary_euc_kr_ack_decodes() {
        let frame = r#"{"header":{"tr_id":"H0STCNT0"},"body":{"rt_cd":"0","msg1":"정상처리 되었습니다"}}"#;
        let (bytes, _, had_errors) = encoding_rs::EUC_KR.encode(frame);
        assert!(!had_errors);
        match decode_binary(&bytes, now()).unwrap() {
            DecodedFrame::Ack { message, .. } => assert!(message.contains("정상처리")),
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_binary_is_an_error() {
        let err = decode_binary(&[0xff, 0xfe, 0xff], now()).unwrap_err();
        assert!(matches!(err, WireError::Encoding { len: 3 }));
    }

    #[test]
    fn test_control_message_shape() {
        let msg = control_message("KEY-123", "H0STCNT0", "005930", true);
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["header"]["approval_key"], "KEY-123");
        assert_eq!(v["header"]["custtype"], "P");
        assert_eq!(v["header"]["tr_type"], "1");
        assert_eq!(v["header"]["content-type"], "utf-8");
        assert_eq!(v["body"]["input"]["tr_id"], "H0STCNT0");
        assert_eq!(v["body"]["input"]["tr_key"], "005930");

        let unsub = control_message("KEY-123", "H0STCNT0", "005930", false);
        let v: Value = serde_json::from_str(&unsub).unwrap();
        assert_eq!(v["header"]["tr_type"], "0");
    }
}
