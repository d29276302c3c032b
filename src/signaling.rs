//! Коды сигнализации: конверт `{kind, data, timestamp}`, который пользователи
//! передают друг другу вручную вместо сервера сигнализации.
//!
//! Компактная форма: JSON → gzip → base64. Декодер также принимает сырой JSON
//! и голое описание `{"type", "sdp"}` без конверта.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

use crate::config::CodeEncoding;
use crate::error::DecodeError;
use crate::peer::types::{SdpKind, SessionDescription};
use crate::utils::now_millis;

/// Текущая версия конверта
pub const CODE_VERSION: u32 = 1;

/// Ограничение на размер распакованных данных (защита от zip-bomb)
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// Неизменяемый код сигнализации
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingCode {
    pub kind: SdpKind,
    pub description: SessionDescription,
    /// epoch ms; 0 если код пришёл без конверта
    pub created_at: i64,
    /// Идентификатор сессии, общий для offer и answer
    pub session_id: Option<String>,
    /// None для старого формата без версии
    pub version: Option<u32>,
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    version: u32,
    kind: SdpKind,
    data: &'a SessionDescription,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

#[derive(Deserialize)]
struct RawDescription {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

impl SignalingCode {
    pub fn new(description: SessionDescription, session_id: Option<String>) -> Self {
        Self::at(description, session_id, now_millis())
    }

    pub fn at(description: SessionDescription, session_id: Option<String>, created_at: i64) -> Self {
        Self {
            kind: description.kind,
            description,
            created_at,
            session_id,
            version: Some(CODE_VERSION),
        }
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        if self.created_at == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.created_at).single()
    }

    /// Короткий отпечаток SDP, чтобы собеседники могли сверить код голосом
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.description.sdp.as_bytes());
        hex::encode(&digest[..6])
    }

    pub fn encode(&self, encoding: CodeEncoding) -> io::Result<String> {
        encode(self, encoding)
    }
}

/// Сериализация кода; при фиксированном `created_at` детерминирована
pub fn encode(code: &SignalingCode, encoding: CodeEncoding) -> io::Result<String> {
    let envelope = EnvelopeOut {
        version: CODE_VERSION,
        kind: code.kind,
        data: &code.description,
        timestamp: code.created_at,
        id: code.session_id.as_deref(),
    };

    match encoding {
        CodeEncoding::Json => Ok(serde_json::to_string(&envelope)?),
        CodeEncoding::Compact => {
            let json = serde_json::to_vec(&envelope)?;
            let mut gz = GzEncoder::new(Vec::new(), Compression::best());
            gz.write_all(&json)?;
            let compressed = gz.finish()?;
            Ok(general_purpose::STANDARD.encode(compressed))
        }
    }
}

/// Разбор кода. Без побочных эффектов: UI может проверить вставленный код
/// до того, как трогать сессию.
pub fn decode(text: &str) -> Result<SignalingCode, DecodeError> {
    let json = unwrap_transport(text)?;
    let value: Value =
        serde_json::from_slice(&json).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    };

    // голое описание из браузера: {"type": "...", "sdp": "..."}
    let Some(kind) = fields.remove("kind") else {
        let description = parse_description(Value::Object(fields))?;
        return Ok(SignalingCode {
            kind: description.kind,
            description,
            created_at: 0,
            session_id: None,
            version: None,
        });
    };

    let kind = match kind {
        Value::String(kind) => parse_kind(&kind)?,
        other => return Err(DecodeError::Malformed(format!("kind must be a string, got {other}"))),
    };

    let data = fields
        .remove("data")
        .ok_or_else(|| DecodeError::Malformed("missing data".into()))?;
    let description = parse_description(data)?;
    if description.kind != kind {
        return Err(DecodeError::KindMismatch {
            envelope: kind.as_str().into(),
            description: description.kind.as_str().into(),
        });
    }

    let created_at = match fields.remove("timestamp") {
        None | Some(Value::Null) => 0,
        Some(ts) => ts
            .as_i64()
            .ok_or_else(|| DecodeError::Malformed(format!("bad timestamp {ts}")))?,
    };
    let session_id = match fields.remove("id") {
        Some(Value::String(id)) => Some(id),
        _ => None,
    };
    let version = fields
        .remove("version")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok());

    Ok(SignalingCode {
        kind,
        description,
        created_at,
        session_id,
        version,
    })
}

fn parse_kind(kind: &str) -> Result<SdpKind, DecodeError> {
    match kind {
        "offer" => Ok(SdpKind::Offer),
        "answer" => Ok(SdpKind::Answer),
        other => Err(DecodeError::UnknownKind(other.into())),
    }
}

fn parse_description(value: Value) -> Result<SessionDescription, DecodeError> {
    let raw: RawDescription =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if raw.sdp.trim().is_empty() {
        return Err(DecodeError::Malformed("empty sdp".into()));
    }
    Ok(SessionDescription {
        kind: parse_kind(&raw.kind)?,
        sdp: raw.sdp,
    })
}

/// Снимает транспортную обёртку: сырой JSON или base64(gzip(JSON))
fn unwrap_transport(text: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Malformed("empty code".into()));
    }
    if trimmed.starts_with('{') {
        return Ok(trimmed.as_bytes().to_vec());
    }

    // при копировании код часто переносится по строкам
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let compressed = general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| DecodeError::Malformed(format!("base64: {e}")))?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut json)
        .map_err(|e| DecodeError::Malformed(format!("gzip: {e}")))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(DecodeError::Malformed("code is too large".into()));
    }
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn compact_and_json_codes_round_trip() {
        for description in [SessionDescription::offer(SDP), SessionDescription::answer(SDP)] {
            let code = SignalingCode::at(description.clone(), Some("ab12".into()), 1_700_000_000_000);
            for encoding in [CodeEncoding::Compact, CodeEncoding::Json] {
                let text = code.encode(encoding).unwrap();
                let decoded = decode(&text).unwrap();
                assert_eq!(decoded.kind, description.kind);
                assert_eq!(decoded.description, description);
                assert_eq!(decoded, code);
            }
        }
    }

    #[test]
    fn encoding_is_deterministic_for_fixed_timestamp() {
        let code = SignalingCode::at(SessionDescription::offer(SDP), None, 42);
        assert_eq!(
            code.encode(CodeEncoding::Json).unwrap(),
            code.encode(CodeEncoding::Json).unwrap()
        );
    }

    #[test]
    fn unversioned_envelope_is_accepted() {
        let text = serde_json::json!({
            "kind": "answer",
            "data": {"type": "answer", "sdp": SDP},
            "timestamp": 1_700_000_000_000i64,
        })
        .to_string();
        let code = decode(&text).unwrap();
        assert_eq!(code.kind, SdpKind::Answer);
        assert_eq!(code.version, None);
        assert!(code.created_at_utc().is_some());
    }

    #[test]
    fn bare_description_is_accepted() {
        let text = serde_json::json!({"type": "offer", "sdp": SDP}).to_string();
        let code = decode(&text).unwrap();
        assert_eq!(code.kind, SdpKind::Offer);
        assert_eq!(code.created_at_utc(), None);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let text = serde_json::json!({
            "kind": "pranswer",
            "data": {"type": "answer", "sdp": SDP},
            "timestamp": 1,
        })
        .to_string();
        assert_eq!(decode(&text), Err(DecodeError::UnknownKind("pranswer".into())));
    }

    #[test]
    fn mismatched_kind_is_reported() {
        let text = serde_json::json!({
            "kind": "offer",
            "data": {"type": "answer", "sdp": SDP},
            "timestamp": 1,
        })
        .to_string();
        assert!(matches!(decode(&text), Err(DecodeError::KindMismatch { .. })));
    }

    #[test]
    fn garbage_is_malformed() {
        for text in ["", "   ", "not base64 at all!", "{\"kind\":", "[1,2,3]", "aGVsbG8="] {
            assert!(
                matches!(decode(text), Err(DecodeError::Malformed(_))),
                "{text:?} should be malformed"
            );
        }
    }

    #[test]
    fn wrapped_compact_code_is_accepted() {
        let code = SignalingCode::at(SessionDescription::offer(SDP), None, 7);
        let text = code.encode(CodeEncoding::Compact).unwrap();
        let (head, tail) = text.split_at(text.len() / 2);
        let wrapped = format!("  {head}\n{tail}\n");
        assert_eq!(decode(&wrapped).unwrap(), code);
    }

    #[test]
    fn fingerprint_depends_on_sdp_only() {
        let a = SignalingCode::at(SessionDescription::offer(SDP), None, 1);
        let b = SignalingCode::at(SessionDescription::offer(SDP), Some("x".into()), 2);
        let c = SignalingCode::at(SessionDescription::offer("v=0\r\n"), None, 1);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 12);
    }
}
