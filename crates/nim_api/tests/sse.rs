use nim_api::{FinishReason, NimStreamEvent, SseStreamParser};

#[test]
fn sse_maps_content_finish_and_done() {
    let events = SseStreamParser::parse_frames(concat!(
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"length\"}]}\n\n",
        "data: [DONE]\n\n",
    ));

    assert_eq!(
        events,
        vec![
            NimStreamEvent::ContentDelta {
                delta: "Hi".to_string()
            },
            NimStreamEvent::Finished {
                reason: FinishReason::Length
            },
            NimStreamEvent::Done,
        ]
    );
}

#[test]
fn sse_maps_in_band_errors() {
    let events = SseStreamParser::parse_frames(
        "data: {\"error\":{\"code\":\"overloaded\",\"message\":\"try later\"}}\n\n",
    );

    assert_eq!(
        events,
        vec![NimStreamEvent::Error {
            code: Some("overloaded".to_string()),
            message: Some("try later".to_string()),
        }]
    );
}

#[test]
fn sse_ignores_comments_and_malformed_json() {
    let events = SseStreamParser::parse_frames(": keep-alive\n\ndata: {not json}\n\n");
    assert!(events.is_empty());
}

#[test]
fn sse_keeps_partial_frames_buffered() {
    let mut parser = SseStreamParser::default();
    assert!(parser.feed(b"data: [DO").is_empty());
    assert!(!parser.is_empty_buffer());
    assert_eq!(parser.feed(b"NE]\n\n"), vec![NimStreamEvent::Done]);
}

#[test]
fn finish_reason_parse_keeps_unknown_values() {
    assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
    assert_eq!(
        FinishReason::parse("abort"),
        FinishReason::Other("abort".to_string())
    );
    assert_eq!(FinishReason::parse("abort").as_str(), "abort");
}
