//! Audio bitrate shaping for server generated offers.

use std::io::Cursor;

use webrtc::sdp::description::{
    common::{Attribute, Bandwidth},
    media::MediaDescription,
    session::SessionDescription,
};

/// Lowest bitrate Opus accepts, bits per second.
pub const MIN_OPUS_BITRATE: u64 = 6_000;
/// Highest bitrate Opus accepts, bits per second.
pub const MAX_OPUS_BITRATE: u64 = 510_000;

const MAX_AVERAGE_BITRATE: &str = "maxaveragebitrate";

/// Caps every audio section of `sdp` at `max_bitrate` (clamped into the Opus range).
///
/// `b=TIAS` and `b=AS` are overwritten and `maxaveragebitrate` is set in the fmtp line of the
/// Opus payload type, keeping any other fmtp parameters. SDP that does not parse is returned
/// as is.
pub fn limit_audio_bitrate_in_sdp(sdp: &str, max_bitrate: u64) -> String {
    let bitrate = max_bitrate.clamp(MIN_OPUS_BITRATE, MAX_OPUS_BITRATE);

    let mut reader = Cursor::new(sdp.as_bytes());
    let mut session = match SessionDescription::unmarshal(&mut reader) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!("failed to parse SDP, leaving it untouched: {}", err);
            return sdp.to_string();
        }
    };

    for media in session
        .media_descriptions
        .iter_mut()
        .filter(|media| media.media_name.media == "audio")
    {
        set_bandwidth(media, bitrate);
        match opus_payload_type(media) {
            Some(payload_type) => set_max_average_bitrate(media, &payload_type, bitrate),
            None => tracing::debug!("audio section without opus, only bandwidth lines are set"),
        }
    }

    session.marshal()
}

fn set_bandwidth(media: &mut MediaDescription, bitrate: u64) {
    media.bandwidth.retain(|b| {
        !b.bandwidth_type.eq_ignore_ascii_case("TIAS") && !b.bandwidth_type.eq_ignore_ascii_case("AS")
    });
    media.bandwidth.push(Bandwidth {
        experimental: false,
        bandwidth_type: "AS".to_string(),
        bandwidth: bitrate.div_ceil(1000),
    });
    media.bandwidth.push(Bandwidth {
        experimental: false,
        bandwidth_type: "TIAS".to_string(),
        bandwidth: bitrate,
    });
}

fn opus_payload_type(media: &MediaDescription) -> Option<String> {
    media
        .attributes
        .iter()
        .filter(|attr| attr.key == "rtpmap")
        .filter_map(|attr| attr.value.as_deref())
        .find_map(|value| {
            let (payload_type, encoding) = value.trim().split_once(' ')?;
            let name = encoding.split('/').next()?;
            name.eq_ignore_ascii_case("opus")
                .then(|| payload_type.to_string())
        })
}

fn set_max_average_bitrate(media: &mut MediaDescription, payload_type: &str, bitrate: u64) {
    let target = format!("{}={}", MAX_AVERAGE_BITRATE, bitrate);

    let fmtp = media.attributes.iter_mut().find(|attr| {
        attr.key == "fmtp"
            && attr
                .value
                .as_deref()
                .map(|value| fmtp_payload_type(value) == payload_type)
                .unwrap_or(false)
    });

    match fmtp {
        Some(attr) => {
            let value = attr.value.as_deref().unwrap_or_default();
            let params = value
                .trim()
                .split_once(' ')
                .map(|(_, params)| params)
                .unwrap_or("");
            let mut replaced = false;
            let mut params: Vec<String> = params
                .split(';')
                .map(str::trim)
                .filter(|param| !param.is_empty())
                .map(|param| {
                    let key = param.split('=').next().unwrap_or(param).trim();
                    if key.eq_ignore_ascii_case(MAX_AVERAGE_BITRATE) {
                        replaced = true;
                        target.clone()
                    } else {
                        param.to_string()
                    }
                })
                .collect();
            if !replaced {
                params.push(target);
            }
            attr.value = Some(format!("{} {}", payload_type, params.join(";")));
        }
        None => media.attributes.push(Attribute {
            key: "fmtp".to_string(),
            value: Some(format!("{} {}", payload_type, target)),
        }),
    }
}

fn fmtp_payload_type(value: &str) -> &str {
    let value = value.trim();
    value.split_once(' ').map(|(pt, _)| pt).unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_with_bandwidth(audio_bandwidth: &[&str], audio_extra: &[&str]) -> String {
        let mut lines = vec![
            "v=0",
            "o=- 4215775240449105457 2 IN IP4 127.0.0.1",
            "s=-",
            "t=0 0",
            "a=group:BUNDLE 0 1",
            "m=audio 9 UDP/TLS/RTP/SAVPF 111 0",
            "c=IN IP4 0.0.0.0",
        ];
        lines.extend_from_slice(audio_bandwidth);
        lines.extend_from_slice(&[
            "a=mid:0",
            "a=rtpmap:111 opus/48000/2",
            "a=rtpmap:0 PCMU/8000",
        ]);
        lines.extend_from_slice(audio_extra);
        lines.extend_from_slice(&[
            "a=sendrecv",
            "m=video 9 UDP/TLS/RTP/SAVPF 96",
            "c=IN IP4 0.0.0.0",
            "b=AS:2000",
            "a=mid:1",
            "a=rtpmap:96 VP8/90000",
            "a=sendrecv",
        ]);
        let mut sdp = lines.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    fn offer(audio_extra: &[&str]) -> String {
        offer_with_bandwidth(&[], audio_extra)
    }

    fn parse(sdp: &str) -> SessionDescription {
        SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes())).unwrap()
    }

    fn fmtp(media: &MediaDescription, payload_type: &str) -> Option<String> {
        media
            .attributes
            .iter()
            .filter(|attr| attr.key == "fmtp")
            .filter_map(|attr| attr.value.clone())
            .find(|value| fmtp_payload_type(value) == payload_type)
    }

    fn bandwidth(media: &MediaDescription, kind: &str) -> Vec<u64> {
        media
            .bandwidth
            .iter()
            .filter(|b| b.bandwidth_type == kind)
            .map(|b| b.bandwidth)
            .collect()
    }

    #[test]
    fn test_sets_bandwidth_and_fmtp() {
        let sdp = limit_audio_bitrate_in_sdp(
            &offer_with_bandwidth(
                &["b=AS:512", "b=TIAS:512000"],
                &["a=fmtp:111 minptime=10;useinbandfec=1"],
            ),
            64_000,
        );
        let session = parse(&sdp);
        let audio = &session.media_descriptions[0];
        assert_eq!(bandwidth(audio, "TIAS"), vec![64_000]);
        assert_eq!(bandwidth(audio, "AS"), vec![64]);
        assert_eq!(
            fmtp(audio, "111").as_deref(),
            Some("111 minptime=10;useinbandfec=1;maxaveragebitrate=64000")
        );
    }

    #[test]
    fn test_clamps_into_opus_range() {
        let low = parse(&limit_audio_bitrate_in_sdp(&offer(&[]), 1));
        assert_eq!(
            fmtp(&low.media_descriptions[0], "111").as_deref(),
            Some("111 maxaveragebitrate=6000")
        );

        let high = parse(&limit_audio_bitrate_in_sdp(&offer(&[]), 10_000_000));
        assert_eq!(
            fmtp(&high.media_descriptions[0], "111").as_deref(),
            Some("111 maxaveragebitrate=510000")
        );
        assert_eq!(bandwidth(&high.media_descriptions[0], "TIAS"), vec![510_000]);
    }

    #[test]
    fn test_existing_value_is_replaced() {
        let sdp = limit_audio_bitrate_in_sdp(
            &offer(&["a=fmtp:111 maxaveragebitrate=128000;stereo=1"]),
            32_000,
        );
        let session = parse(&sdp);
        assert_eq!(
            fmtp(&session.media_descriptions[0], "111").as_deref(),
            Some("111 maxaveragebitrate=32000;stereo=1")
        );
    }

    #[test]
    fn test_applying_twice_is_stable() {
        let once = limit_audio_bitrate_in_sdp(&offer(&["a=fmtp:111 useinbandfec=1"]), 48_000);
        let twice = limit_audio_bitrate_in_sdp(&once, 48_000);
        assert_eq!(once, twice);
        let session = parse(&twice);
        let audio = &session.media_descriptions[0];
        assert_eq!(bandwidth(audio, "TIAS"), vec![48_000]);
        assert_eq!(
            fmtp(audio, "111").as_deref(),
            Some("111 useinbandfec=1;maxaveragebitrate=48000")
        );
    }

    #[test]
    fn test_video_section_is_untouched() {
        let session = parse(&limit_audio_bitrate_in_sdp(&offer(&[]), 64_000));
        let video = &session.media_descriptions[1];
        assert_eq!(bandwidth(video, "AS"), vec![2000]);
        assert!(bandwidth(video, "TIAS").is_empty());
        assert!(fmtp(video, "96").is_none());
    }

    #[test]
    fn test_unparsable_sdp_is_returned_as_is() {
        let garbage = "this is not a session description";
        assert_eq!(limit_audio_bitrate_in_sdp(garbage, 64_000), garbage);
    }
}
