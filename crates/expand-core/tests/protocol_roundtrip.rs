//! Integration tests for the expand-core protocol codec.
//!
//! These tests drive complete messages through the public API: typed payload
//! to bytes, bytes through the framed codec, and back again.

use expand_core::{
    decode_message, encode_message,
    protocol::{
        payloads::{
            AudioFrameMessage, BitrateControlMessage, ErrorMessage, FecConfigMessage,
            FecShardMessage, HandshakeAckMessage, HandshakeMessage, HeartbeatAckMessage,
            HeartbeatMessage, KeyFrameRequestMessage, ProtocolFeedbackMessage, TouchAction,
            TouchEventMessage, VideoFrameMessage,
        },
        sequence::{SequenceCounter, SequenceObservation, SequenceTracker},
        DEFAULT_MAX_PAYLOAD_SIZE,
    },
    Message, MessageType, ProtocolError, WirePayload, HEADER_SIZE,
};

/// Encodes a payload into a framed message and decodes it back, asserting
/// that every byte was consumed.
fn roundtrip<T: WirePayload>(payload: &T) -> T {
    let counter = SequenceCounter::new();
    let msg = Message::new(
        T::MESSAGE_TYPE,
        counter.next(),
        12345,
        payload.to_message_payload().expect("encode must succeed"),
    );
    let bytes = encode_message(&msg);
    let (decoded, consumed) =
        decode_message(&bytes, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode must succeed");
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    assert_eq!(decoded.header.timestamp_ms, 12345);
    decoded.decode_payload::<T>().expect("payload must decode")
}

#[test]
fn test_roundtrip_handshake() {
    let original = HandshakeMessage {
        device_id: "android-1".to_string(),
        device_name: "Galaxy Tab".to_string(),
        client_version: "1.2.0".to_string(),
        screen_width: 2560,
        screen_height: 1600,
    };
    assert_eq!(original, roundtrip(&original));
}

#[test]
fn test_roundtrip_handshake_ack_with_rejection() {
    let original = HandshakeAckMessage {
        session_id: String::new(),
        server_version: "1.0.0".to_string(),
        accepted: false,
        error_message: Some("device not paired".to_string()),
    };
    assert_eq!(original, roundtrip(&original));
}

#[test]
fn test_roundtrip_heartbeat_pair() {
    let hb = HeartbeatMessage { timestamp: 1000 };
    let ack = HeartbeatAckMessage {
        original_timestamp: 1000,
        response_timestamp: 1012,
    };
    assert_eq!(hb, roundtrip(&hb));
    assert_eq!(ack, roundtrip(&ack));
}

#[test]
fn test_roundtrip_feedback_and_rate_control() {
    let feedback = ProtocolFeedbackMessage {
        timestamp: 5,
        average_rtt_ms: 17.25,
        total_messages: 9000,
        dropped_messages: 12,
        total_messages_delta: 300,
        dropped_messages_delta: 1,
        receive_rate_bps: 7_250_000.0,
    };
    let control = BitrateControlMessage {
        timestamp: 6,
        target_bitrate_bps: 6_800_000,
        reason: "loss".to_string(),
    };
    let key_frame = KeyFrameRequestMessage {
        timestamp: 7,
        reason: "unrecoverable loss".to_string(),
    };
    assert_eq!(feedback, roundtrip(&feedback));
    assert_eq!(control, roundtrip(&control));
    assert_eq!(key_frame, roundtrip(&key_frame));
}

#[test]
fn test_roundtrip_media_payloads_preserve_binary_data() {
    let video = VideoFrameMessage {
        frame_number: 42,
        presentation_ts_ms: 1400,
        width: 1920,
        height: 1080,
        is_key_frame: true,
        data: (0..=255u8).cycle().take(4096).collect(),
    };
    let audio = AudioFrameMessage {
        presentation_ts_ms: 1401,
        sample_rate: 48_000,
        channels: 2,
        data: vec![0x7F; 960],
    };
    assert_eq!(video, roundtrip(&video));
    assert_eq!(audio, roundtrip(&audio));
}

#[test]
fn test_roundtrip_fec_and_misc_payloads() {
    let config = FecConfigMessage {
        enabled: true,
        data_shards: 8,
        parity_shards: 2,
    };
    let shard = FecShardMessage {
        group_id: 77,
        shard_index: 9,
        data_shards: 8,
        parity_shards: 2,
        is_parity: true,
        original_length: 3,
        data: vec![1, 2, 3],
    };
    let touch = TouchEventMessage {
        timestamp: 3,
        pointer_id: 1,
        action: TouchAction::Move,
        x: 0.25,
        y: 0.75,
        pressure: 0.5,
    };
    let error = ErrorMessage {
        code: 500,
        message: "encoder stalled".to_string(),
    };
    assert_eq!(config, roundtrip(&config));
    assert_eq!(shard, roundtrip(&shard));
    assert_eq!(touch, roundtrip(&touch));
    assert_eq!(error, roundtrip(&error));
}

#[test]
fn test_stream_of_messages_decodes_in_order_with_gap_detection() {
    // Arrange – sequence numbers 1, 2, 4, 5 (3 was lost)
    let mut stream = Vec::new();
    for seq in [1u32, 2, 4, 5] {
        let payload = HeartbeatMessage { timestamp: u64::from(seq) }
            .to_message_payload()
            .unwrap();
        stream.extend(encode_message(&Message::new(MessageType::Heartbeat, seq, 0, payload)));
    }

    // Act
    let mut tracker = SequenceTracker::new();
    let mut offset = 0;
    let mut observations = Vec::new();
    while offset < stream.len() {
        let (msg, used) = decode_message(&stream[offset..], 1024).unwrap();
        observations.push(tracker.observe(msg.sequence_number()));
        offset += used;
    }

    // Assert
    assert_eq!(observations.len(), 4);
    assert!(matches!(observations[2], SequenceObservation::Gap(g) if g.missing == 1));
    assert_eq!(tracker.dropped(), 1);
}

#[test]
fn test_partial_buffer_asks_for_more_data() {
    let payload = vec![0u8; 64];
    let bytes = encode_message(&Message::new(MessageType::VideoFrame, 0, 0, payload));

    for cut in [0, 10, HEADER_SIZE, HEADER_SIZE + 63] {
        let err = decode_message(&bytes[..cut], DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(
            matches!(err, ProtocolError::InsufficientData { .. }),
            "cut at {cut} gave {err:?}"
        );
    }
}

#[test]
fn test_typed_decode_of_wrong_type_is_rejected() {
    let payload = HeartbeatMessage { timestamp: 1 }.to_message_payload().unwrap();
    let msg = Message::new(MessageType::Heartbeat, 0, 0, payload);

    let err = msg.decode_payload::<VideoFrameMessage>().unwrap_err();

    assert!(matches!(err, ProtocolError::UnexpectedMessageType { .. }));
}
