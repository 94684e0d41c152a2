//! Capability negotiation between callers, routers and the worker.
//!
//! The orchestration layer only talks to [`RtpNegotiation`]; the worker
//! trusts whatever parameters it computes. [`DefaultNegotiation`] covers
//! codec matching, payload type assignment, RTX companions and SSRC
//! mapping. Embedders with stricter needs plug in their own
//! implementation through [`crate::WorkerSettings`].

use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::rtp_parameters::{
    is_rtx_mime_type, mime_type_kind, CodecParameters, MediaKind, RtcpParameters,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtensionParameters, RtpParameters, RtxParameters,
};
use crate::sctp_parameters::SctpStreamParameters;

const DYNAMIC_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 100..=127;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// Parameters or capabilities are malformed.
    #[error("{0}")]
    Invalid(String),
    /// Well-formed, but incompatible with what the router supports.
    #[error("{0}")]
    Unsupported(String),
}

impl From<NegotiationError> for Error {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Invalid(reason) => Error::TypeValidation(reason),
            NegotiationError::Unsupported(reason) => Error::Unsupported(reason),
        }
    }
}

/// Producer payload type as mapped into the router's payload type space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpMappingCodec {
    pub payload_type: u8,
    pub mapped_payload_type: u8,
}

/// Producer encoding as mapped to a router-chosen SSRC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpMappingEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    pub mapped_ssrc: u32,
}

/// How a producer's stream is rewritten inside the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpMapping {
    pub codecs: Vec<RtpMappingCodec>,
    pub encodings: Vec<RtpMappingEncoding>,
}

/// Pure functions the orchestrators rely on to derive RTP parameters.
pub trait RtpNegotiation: Send + Sync {
    /// Router capabilities for the given media codecs, with payload types
    /// and RTX companions filled in.
    fn router_rtp_capabilities(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RtpCapabilities, NegotiationError>;

    fn validate_rtp_parameters(&self, params: &RtpParameters) -> Result<(), NegotiationError>;

    fn validate_rtp_capabilities(&self, caps: &RtpCapabilities) -> Result<(), NegotiationError>;

    fn validate_sctp_stream_parameters(
        &self,
        params: &SctpStreamParameters,
    ) -> Result<(), NegotiationError>;

    fn producer_rtp_parameters_mapping(
        &self,
        params: &RtpParameters,
        router_caps: &RtpCapabilities,
    ) -> Result<RtpMapping, NegotiationError>;

    /// Parameters every consumer of the producer is derived from.
    fn consumable_rtp_parameters(
        &self,
        kind: MediaKind,
        params: &RtpParameters,
        router_caps: &RtpCapabilities,
        mapping: &RtpMapping,
    ) -> RtpParameters;

    fn can_consume(&self, consumable: &RtpParameters, caps: &RtpCapabilities) -> bool;

    /// Parameters for a consumer with the given receive capabilities. With
    /// `pipe` set every consumable encoding is kept.
    fn consumer_rtp_parameters(
        &self,
        consumable: &RtpParameters,
        caps: &RtpCapabilities,
        pipe: bool,
    ) -> Result<RtpParameters, NegotiationError>;

    /// Parameters for a consumer on a pipe transport.
    fn pipe_consumer_rtp_parameters(
        &self,
        consumable: &RtpParameters,
        enable_rtx: bool,
    ) -> RtpParameters;
}

/// Built-in [`RtpNegotiation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNegotiation;

impl RtpNegotiation for DefaultNegotiation {
    fn router_rtp_capabilities(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RtpCapabilities, NegotiationError> {
        let mut used: BTreeSet<u8> = media_codecs
            .iter()
            .filter_map(|codec| codec.preferred_payload_type)
            .collect();
        let free: Vec<u8> = DYNAMIC_PAYLOAD_TYPES
            .filter(|pt| !used.contains(pt))
            .collect();
        let mut next_dynamic = free.into_iter();
        let mut allocate = |used: &mut BTreeSet<u8>| -> Result<u8, NegotiationError> {
            let pt = next_dynamic.next().ok_or_else(|| {
                NegotiationError::Unsupported("cannot allocate more dynamic payload types".into())
            })?;
            used.insert(pt);
            Ok(pt)
        };

        let mut caps = RtpCapabilities::default();
        for codec in media_codecs {
            validate_codec_capability(codec)?;
            if codec.is_rtx() {
                return Err(NegotiationError::Invalid(
                    "media codecs must not include RTX".into(),
                ));
            }

            let payload_type = match codec.preferred_payload_type {
                Some(pt) => pt,
                None => allocate(&mut used)?,
            };
            caps.codecs.push(RtpCodecCapability {
                preferred_payload_type: Some(payload_type),
                ..codec.clone()
            });

            if codec.kind == MediaKind::Video {
                let mut parameters = CodecParameters::new();
                parameters.insert("apt".into(), Value::from(payload_type));
                caps.codecs.push(RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/rtx".into(),
                    preferred_payload_type: Some(allocate(&mut used)?),
                    clock_rate: codec.clock_rate,
                    channels: None,
                    parameters,
                    rtcp_feedback: Vec::new(),
                });
            }
        }

        Ok(caps)
    }

    fn validate_rtp_parameters(&self, params: &RtpParameters) -> Result<(), NegotiationError> {
        let mut payload_types = BTreeSet::new();
        for codec in &params.codecs {
            if mime_type_kind(&codec.mime_type).is_none() {
                return Err(NegotiationError::Invalid(format!(
                    "invalid codec mimeType \"{}\"",
                    codec.mime_type
                )));
            }
            if codec.clock_rate == 0 {
                return Err(NegotiationError::Invalid("codec clockRate must be positive".into()));
            }
            if !payload_types.insert(codec.payload_type) {
                return Err(NegotiationError::Invalid(format!(
                    "duplicated codec payloadType {}",
                    codec.payload_type
                )));
            }
        }

        for codec in params.codecs.iter().filter(|codec| codec.is_rtx()) {
            let apt = codec.apt().ok_or_else(|| {
                NegotiationError::Invalid("missing apt parameter in RTX codec".into())
            })?;
            if !params.codecs.iter().any(|media| media.payload_type == apt) {
                return Err(NegotiationError::Invalid(format!(
                    "RTX codec points to unknown payloadType {apt}"
                )));
            }
        }

        for encoding in &params.encodings {
            if let Some(pt) = encoding.codec_payload_type {
                if !payload_types.contains(&pt) {
                    return Err(NegotiationError::Invalid(format!(
                        "encoding codecPayloadType {pt} does not match any codec"
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_rtp_capabilities(&self, caps: &RtpCapabilities) -> Result<(), NegotiationError> {
        caps.codecs.iter().try_for_each(validate_codec_capability)
    }

    fn validate_sctp_stream_parameters(
        &self,
        params: &SctpStreamParameters,
    ) -> Result<(), NegotiationError> {
        if params.stream_id > 65534 {
            return Err(NegotiationError::Invalid("streamId must be below 65535".into()));
        }
        if params.max_packet_life_time.is_some() && params.max_retransmits.is_some() {
            return Err(NegotiationError::Invalid(
                "cannot provide both maxPacketLifeTime and maxRetransmits".into(),
            ));
        }
        if params.ordered == Some(true)
            && (params.max_packet_life_time.is_some() || params.max_retransmits.is_some())
        {
            return Err(NegotiationError::Invalid(
                "cannot be ordered with maxPacketLifeTime or maxRetransmits".into(),
            ));
        }
        Ok(())
    }

    fn producer_rtp_parameters_mapping(
        &self,
        params: &RtpParameters,
        router_caps: &RtpCapabilities,
    ) -> Result<RtpMapping, NegotiationError> {
        let mut mapping = RtpMapping::default();

        for codec in params.codecs.iter().filter(|codec| !codec.is_rtx()) {
            let cap = router_caps
                .codecs
                .iter()
                .find(|cap| !cap.is_rtx() && codec_matches(cap, codec))
                .ok_or_else(|| {
                    NegotiationError::Unsupported(format!(
                        "unsupported codec [mimeType:{}, payloadType:{}]",
                        codec.mime_type, codec.payload_type
                    ))
                })?;
            mapping.codecs.push(RtpMappingCodec {
                payload_type: codec.payload_type,
                mapped_payload_type: cap.preferred_payload_type.unwrap_or_default(),
            });
        }

        for codec in params.codecs.iter().filter(|codec| codec.is_rtx()) {
            let Some(media) = codec
                .apt()
                .and_then(|apt| mapping.codecs.iter().find(|m| m.payload_type == apt).copied())
            else {
                continue;
            };
            let cap_rtx = router_caps.codecs.iter().find(|cap| {
                cap.is_rtx()
                    && cap.parameters.get("apt").and_then(Value::as_u64)
                        == Some(u64::from(media.mapped_payload_type))
            });
            if let Some(cap_rtx) = cap_rtx {
                mapping.codecs.push(RtpMappingCodec {
                    payload_type: codec.payload_type,
                    mapped_payload_type: cap_rtx.preferred_payload_type.unwrap_or_default(),
                });
            }
        }

        let base_ssrc = generate_ssrc();
        for (offset, encoding) in (0u32..).zip(&params.encodings) {
            mapping.encodings.push(RtpMappingEncoding {
                ssrc: encoding.ssrc,
                rid: encoding.rid.clone(),
                scalability_mode: encoding.scalability_mode.clone(),
                mapped_ssrc: base_ssrc.wrapping_add(offset),
            });
        }

        Ok(mapping)
    }

    fn consumable_rtp_parameters(
        &self,
        kind: MediaKind,
        params: &RtpParameters,
        router_caps: &RtpCapabilities,
        mapping: &RtpMapping,
    ) -> RtpParameters {
        let mut consumable = RtpParameters {
            rtcp: RtcpParameters {
                cname: params.rtcp.cname.clone(),
                reduced_size: true,
            },
            ..RtpParameters::default()
        };

        for codec in params.codecs.iter().filter(|codec| !codec.is_rtx()) {
            let Some(mapped) = mapping
                .codecs
                .iter()
                .find(|m| m.payload_type == codec.payload_type)
            else {
                continue;
            };
            let Some(cap) = router_caps
                .codecs
                .iter()
                .find(|cap| cap.preferred_payload_type == Some(mapped.mapped_payload_type))
            else {
                continue;
            };

            consumable.codecs.push(RtpCodecParameters {
                mime_type: cap.mime_type.clone(),
                payload_type: mapped.mapped_payload_type,
                clock_rate: cap.clock_rate,
                channels: cap.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: cap.rtcp_feedback.clone(),
            });

            let rtx = router_caps.codecs.iter().find(|cap| {
                cap.is_rtx()
                    && cap.parameters.get("apt").and_then(Value::as_u64)
                        == Some(u64::from(mapped.mapped_payload_type))
            });
            if let Some(rtx) = rtx {
                consumable.codecs.push(RtpCodecParameters {
                    mime_type: rtx.mime_type.clone(),
                    payload_type: rtx.preferred_payload_type.unwrap_or_default(),
                    clock_rate: rtx.clock_rate,
                    channels: None,
                    parameters: rtx.parameters.clone(),
                    rtcp_feedback: Vec::new(),
                });
            }
        }

        for ext in &router_caps.header_extensions {
            if ext.kind.is_some_and(|ext_kind| ext_kind != kind) {
                continue;
            }
            consumable
                .header_extensions
                .push(RtpHeaderExtensionParameters {
                    uri: ext.uri.clone(),
                    id: ext.preferred_id,
                    encrypt: ext.preferred_encrypt,
                    parameters: CodecParameters::new(),
                });
        }

        for (encoding, mapped) in params.encodings.iter().zip(&mapping.encodings) {
            consumable.encodings.push(RtpEncodingParameters {
                ssrc: Some(mapped.mapped_ssrc),
                rid: None,
                codec_payload_type: None,
                rtx: None,
                dtx: encoding.dtx,
                scalability_mode: encoding.scalability_mode.clone(),
                max_bitrate: encoding.max_bitrate,
            });
        }

        consumable
    }

    fn can_consume(&self, consumable: &RtpParameters, caps: &RtpCapabilities) -> bool {
        consumable.codecs.iter().any(|codec| {
            !codec.is_rtx() && caps.codecs.iter().any(|cap| codec_matches(cap, codec))
        })
    }

    fn consumer_rtp_parameters(
        &self,
        consumable: &RtpParameters,
        caps: &RtpCapabilities,
        pipe: bool,
    ) -> Result<RtpParameters, NegotiationError> {
        self.validate_rtp_capabilities(caps)?;

        let mut params = RtpParameters {
            rtcp: consumable.rtcp.clone(),
            ..RtpParameters::default()
        };

        for codec in &consumable.codecs {
            let matched = caps.codecs.iter().find(|cap| {
                if codec.is_rtx() {
                    cap.is_rtx() && cap.clock_rate == codec.clock_rate
                } else {
                    codec_matches(cap, codec)
                }
            });
            if let Some(cap) = matched {
                params.codecs.push(RtpCodecParameters {
                    rtcp_feedback: cap.rtcp_feedback.clone(),
                    ..codec.clone()
                });
            }
        }

        // RTX is only useful next to the media codec it repairs.
        let media_payload_types: BTreeSet<u8> = params
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .map(|codec| codec.payload_type)
            .collect();
        params.codecs.retain(|codec| {
            !codec.is_rtx() || codec.apt().is_some_and(|apt| media_payload_types.contains(&apt))
        });
        let rtx_supported = params.codecs.iter().any(RtpCodecParameters::is_rtx);

        if params.codecs.first().is_none_or(RtpCodecParameters::is_rtx) {
            return Err(NegotiationError::Unsupported(
                "no compatible media codecs".into(),
            ));
        }

        params.header_extensions = consumable
            .header_extensions
            .iter()
            .filter(|ext| {
                caps.header_extensions
                    .iter()
                    .any(|cap| cap.preferred_id == ext.id && cap.uri == ext.uri)
            })
            .cloned()
            .collect();

        if pipe {
            let base = generate_ssrc();
            let rtx_base = generate_ssrc();
            for (offset, encoding) in (0u32..).zip(&consumable.encodings) {
                params.encodings.push(RtpEncodingParameters {
                    ssrc: Some(base.wrapping_add(offset)),
                    rtx: rtx_supported.then(|| RtxParameters {
                        ssrc: rtx_base.wrapping_add(offset),
                    }),
                    ..encoding.clone()
                });
            }
        } else {
            let ssrc = generate_ssrc();
            let mut encoding = RtpEncodingParameters {
                ssrc: Some(ssrc),
                rtx: rtx_supported.then(|| RtxParameters {
                    ssrc: ssrc.wrapping_add(1),
                }),
                ..RtpEncodingParameters::default()
            };

            let mode = consumable
                .encodings
                .first()
                .and_then(|encoding| encoding.scalability_mode.clone());
            encoding.scalability_mode = if consumable.encodings.len() > 1 {
                Some(format!(
                    "S{}T{}",
                    consumable.encodings.len(),
                    temporal_layers(mode.as_deref())
                ))
            } else {
                mode
            };
            encoding.max_bitrate = consumable
                .encodings
                .iter()
                .filter_map(|encoding| encoding.max_bitrate)
                .max();

            params.encodings.push(encoding);
        }

        Ok(params)
    }

    fn pipe_consumer_rtp_parameters(
        &self,
        consumable: &RtpParameters,
        enable_rtx: bool,
    ) -> RtpParameters {
        let mut params = RtpParameters {
            rtcp: consumable.rtcp.clone(),
            header_extensions: consumable.header_extensions.clone(),
            ..RtpParameters::default()
        };

        for codec in &consumable.codecs {
            if !enable_rtx && codec.is_rtx() {
                continue;
            }
            let mut codec = codec.clone();
            codec.rtcp_feedback.retain(|fb| {
                (enable_rtx || fb.kind != "nack" || !fb.parameter.is_empty())
                    && fb.kind != "goog-remb"
                    && fb.kind != "transport-cc"
            });
            params.codecs.push(codec);
        }

        let rtx_base = generate_ssrc();
        for (offset, encoding) in (0u32..).zip(&consumable.encodings) {
            params.encodings.push(RtpEncodingParameters {
                rtx: enable_rtx.then(|| RtxParameters {
                    ssrc: rtx_base.wrapping_add(offset),
                }),
                ..encoding.clone()
            });
        }

        params
    }
}

fn validate_codec_capability(codec: &RtpCodecCapability) -> Result<(), NegotiationError> {
    match mime_type_kind(&codec.mime_type) {
        Some(kind) if kind == codec.kind => {}
        Some(_) => {
            return Err(NegotiationError::Invalid(format!(
                "codec kind does not match mimeType \"{}\"",
                codec.mime_type
            )))
        }
        None => {
            return Err(NegotiationError::Invalid(format!(
                "invalid codec mimeType \"{}\"",
                codec.mime_type
            )))
        }
    }
    if codec.clock_rate == 0 {
        return Err(NegotiationError::Invalid("codec clockRate must be positive".into()));
    }
    Ok(())
}

/// Same MIME type, clock rate and (for audio) channel count.
fn codec_matches(cap: &RtpCodecCapability, codec: &RtpCodecParameters) -> bool {
    if !cap.mime_type.eq_ignore_ascii_case(&codec.mime_type) || cap.clock_rate != codec.clock_rate
    {
        return false;
    }
    if is_rtx_mime_type(&cap.mime_type) {
        return true;
    }
    match cap.kind {
        MediaKind::Audio => cap.channels.unwrap_or(1) == codec.channels.unwrap_or(1),
        MediaKind::Video => true,
    }
}

/// Temporal layer count of an `LxTy`/`SxTy` scalability mode, 1 if absent.
fn temporal_layers(mode: Option<&str>) -> u8 {
    mode.and_then(|mode| mode.split_once('T'))
        .and_then(|(_, rest)| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .unwrap_or(1)
}

fn generate_ssrc() -> u32 {
    rand::thread_rng().gen_range(100_000_000..=999_999_999)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::rtp_parameters::RtcpFeedback;

    fn media_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".into(),
                preferred_payload_type: None,
                clock_rate: 48000,
                channels: Some(2),
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".into(),
                preferred_payload_type: None,
                clock_rate: 90000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![RtcpFeedback::new("nack", ""), RtcpFeedback::new("nack", "pli")],
            },
        ]
    }

    fn vp8_params() -> RtpParameters {
        serde_json::from_value(json!({
            "mid": "0",
            "codecs": [
                { "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 },
                { "mimeType": "video/rtx", "payloadType": 97, "clockRate": 90000, "parameters": { "apt": 96 } }
            ],
            "encodings": [
                { "rid": "r0", "scalabilityMode": "L1T3", "maxBitrate": 100000 },
                { "rid": "r1", "scalabilityMode": "L1T3", "maxBitrate": 500000 }
            ],
            "rtcp": { "cname": "abc" }
        }))
        .unwrap()
    }

    #[test]
    fn router_capabilities_assign_dynamic_payload_types_and_rtx() {
        let caps = DefaultNegotiation
            .router_rtp_capabilities(&media_codecs())
            .unwrap();

        let pts: Vec<Option<u8>> = caps.codecs.iter().map(|c| c.preferred_payload_type).collect();
        assert_eq!(pts, vec![Some(100), Some(101), Some(102)]);
        assert!(caps.codecs[2].is_rtx());
        assert_eq!(caps.codecs[2].parameters.get("apt"), Some(&json!(101)));
    }

    #[test]
    fn router_capabilities_reject_bad_mime_type() {
        let mut codecs = media_codecs();
        codecs[0].mime_type = "opus".into();
        assert!(matches!(
            DefaultNegotiation.router_rtp_capabilities(&codecs),
            Err(NegotiationError::Invalid(_))
        ));
    }

    #[test]
    fn mapping_and_consumable_parameters() {
        let caps = DefaultNegotiation
            .router_rtp_capabilities(&media_codecs())
            .unwrap();
        let params = vp8_params();

        let mapping = DefaultNegotiation
            .producer_rtp_parameters_mapping(&params, &caps)
            .unwrap();
        assert_eq!(
            mapping.codecs,
            vec![
                RtpMappingCodec { payload_type: 96, mapped_payload_type: 101 },
                RtpMappingCodec { payload_type: 97, mapped_payload_type: 102 },
            ]
        );
        assert_eq!(mapping.encodings.len(), 2);
        assert_eq!(
            mapping.encodings[1].mapped_ssrc,
            mapping.encodings[0].mapped_ssrc.wrapping_add(1)
        );

        let consumable =
            DefaultNegotiation.consumable_rtp_parameters(MediaKind::Video, &params, &caps, &mapping);
        assert_eq!(consumable.codecs.len(), 2);
        assert_eq!(consumable.codecs[0].payload_type, 101);
        assert_eq!(consumable.encodings[0].ssrc, Some(mapping.encodings[0].mapped_ssrc));
        assert_eq!(consumable.rtcp.cname.as_deref(), Some("abc"));
        assert!(consumable.mid.is_none());
    }

    #[test]
    fn unsupported_codec_is_rejected() {
        let caps = DefaultNegotiation
            .router_rtp_capabilities(&media_codecs()[..1])
            .unwrap();
        let err = DefaultNegotiation
            .producer_rtp_parameters_mapping(&vp8_params(), &caps)
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Unsupported(_)));
    }

    #[test]
    fn consumer_gets_single_encoding_for_simulcast() {
        let caps = DefaultNegotiation
            .router_rtp_capabilities(&media_codecs())
            .unwrap();
        let params = vp8_params();
        let mapping = DefaultNegotiation
            .producer_rtp_parameters_mapping(&params, &caps)
            .unwrap();
        let consumable =
            DefaultNegotiation.consumable_rtp_parameters(MediaKind::Video, &params, &caps, &mapping);

        assert!(DefaultNegotiation.can_consume(&consumable, &caps));
        let consumer = DefaultNegotiation
            .consumer_rtp_parameters(&consumable, &caps, false)
            .unwrap();
        assert_eq!(consumer.encodings.len(), 1);
        assert_eq!(consumer.encodings[0].scalability_mode.as_deref(), Some("S2T3"));
        assert_eq!(consumer.encodings[0].max_bitrate, Some(500000));
        let ssrc = consumer.encodings[0].ssrc.unwrap();
        assert_eq!(consumer.encodings[0].rtx, Some(RtxParameters { ssrc: ssrc + 1 }));

        let piped = DefaultNegotiation
            .consumer_rtp_parameters(&consumable, &caps, true)
            .unwrap();
        assert_eq!(piped.encodings.len(), 2);
    }

    #[test]
    fn cannot_consume_without_common_codec() {
        let caps = DefaultNegotiation
            .router_rtp_capabilities(&media_codecs())
            .unwrap();
        let params = vp8_params();
        let mapping = DefaultNegotiation
            .producer_rtp_parameters_mapping(&params, &caps)
            .unwrap();
        let consumable =
            DefaultNegotiation.consumable_rtp_parameters(MediaKind::Video, &params, &caps, &mapping);

        let audio_only = RtpCapabilities {
            codecs: media_codecs()[..1].to_vec(),
            header_extensions: Vec::new(),
        };
        assert!(!DefaultNegotiation.can_consume(&consumable, &audio_only));
        assert!(DefaultNegotiation
            .consumer_rtp_parameters(&consumable, &audio_only, false)
            .is_err());
    }

    #[test]
    fn pipe_consumer_drops_rtx_when_disabled() {
        let caps = DefaultNegotiation
            .router_rtp_capabilities(&media_codecs())
            .unwrap();
        let params = vp8_params();
        let mapping = DefaultNegotiation
            .producer_rtp_parameters_mapping(&params, &caps)
            .unwrap();
        let consumable =
            DefaultNegotiation.consumable_rtp_parameters(MediaKind::Video, &params, &caps, &mapping);

        let piped = DefaultNegotiation.pipe_consumer_rtp_parameters(&consumable, false);
        assert!(piped.codecs.iter().all(|codec| !codec.is_rtx()));
        assert!(piped.codecs[0]
            .rtcp_feedback
            .iter()
            .all(|fb| !(fb.kind == "nack" && fb.parameter.is_empty())));
        assert_eq!(piped.encodings.len(), 2);
        assert!(piped.encodings.iter().all(|e| e.rtx.is_none()));
    }

    #[test]
    fn rtx_pointing_nowhere_is_invalid() {
        let mut params = vp8_params();
        params.codecs[1].parameters.insert("apt".into(), json!(55));
        assert!(DefaultNegotiation.validate_rtp_parameters(&params).is_err());
    }

    #[test]
    fn sctp_stream_parameter_rules() {
        let ok = SctpStreamParameters::new_unordered_with_retransmits(3, 5);
        assert!(DefaultNegotiation.validate_sctp_stream_parameters(&ok).is_ok());

        let both = SctpStreamParameters {
            max_packet_life_time: Some(10),
            ..ok
        };
        assert!(DefaultNegotiation.validate_sctp_stream_parameters(&both).is_err());

        let ordered = SctpStreamParameters {
            ordered: Some(true),
            ..ok
        };
        assert!(DefaultNegotiation.validate_sctp_stream_parameters(&ordered).is_err());
    }

    #[test]
    fn temporal_layer_parsing() {
        assert_eq!(temporal_layers(Some("L1T3")), 3);
        assert_eq!(temporal_layers(Some("S3T2_KEY")), 2);
        assert_eq!(temporal_layers(None), 1);
    }
}
