//! Wire round-trip tests for every envelope kind.
//!
//! Each test encodes an envelope through the framed codec and decodes it
//! back, asserting the result equals the original.

use neverliie::protocol::codec::{read_envelope, write_envelope};
use neverliie::Envelope;
use serde_json::{json, Map};

async fn roundtrip(env: &Envelope) -> Envelope {
    let mut buf = std::io::Cursor::new(Vec::new());
    write_envelope(&mut buf, env).await.expect("encode");
    let bytes = buf.into_inner();
    let mut rd = bytes.as_slice();
    let back = read_envelope(&mut rd).await.expect("decode").expect("frame");
    assert!(
        read_envelope(&mut rd).await.unwrap().is_none(),
        "no trailing bytes after one frame"
    );
    back
}

// ── REQUEST ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn request_roundtrip() {
    let mut kwargs = Map::new();
    kwargs.insert("depth".into(), json!(3));
    kwargs.insert("label".into(), json!("résumé ✓"));
    let env = Envelope::request("scan", vec![json!("/tmp"), json!(true)], kwargs);
    assert_eq!(roundtrip(&env).await, env);
}

#[tokio::test]
async fn request_with_no_arguments() {
    let env = Envelope::request("__ping__", vec![], Map::new());
    assert_eq!(roundtrip(&env).await, env);
}

#[tokio::test]
async fn request_with_nested_payload() {
    let env = Envelope::request(
        "configure",
        vec![json!({ "rows": [1, 2, 3], "theme": { "dark": true, "accent": null } })],
        Map::new(),
    );
    assert_eq!(roundtrip(&env).await, env);
}

// ── OK / ERROR / PONG ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ok_roundtrip_for_assorted_value_shapes() {
    for data in [
        json!(null),
        json!(5),
        json!(-17),
        json!(2.5),
        json!("plain"),
        json!([1, "two", null]),
        json!({ "k": { "nested": [true, false] } }),
    ] {
        let env = Envelope::Ok { data };
        assert_eq!(roundtrip(&env).await, env);
    }
}

#[tokio::test]
async fn error_roundtrip_keeps_the_message() {
    let env = Envelope::error("division by zero in handler 'ratio'");
    match roundtrip(&env).await {
        Envelope::Error { msg } => assert!(msg.contains("ratio")),
        other => panic!("wrong variant: {other:?}"),
    }
}

#[tokio::test]
async fn pong_roundtrip() {
    assert_eq!(roundtrip(&Envelope::Pong).await, Envelope::Pong);
}

// ── Stream frames ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_start_preserves_the_task_id() {
    let env = Envelope::StreamStart {
        task_id: "0b7f77f4-2f2a-4b3f-9a64-demo".into(),
    };
    assert_eq!(roundtrip(&env).await, env);
}

#[tokio::test]
async fn progress_roundtrip_with_large_payload() {
    let big: Vec<u64> = (0..10_000).collect();
    let env = Envelope::Progress { data: json!(big) };
    assert_eq!(roundtrip(&env).await, env);
}

#[tokio::test]
async fn stream_end_roundtrip() {
    assert_eq!(roundtrip(&Envelope::StreamEnd).await, Envelope::StreamEnd);
}

// ── Encode determinism ────────────────────────────────────────────────────────

#[tokio::test]
async fn same_envelope_encodes_identically() {
    let env = Envelope::Ok {
        data: json!({ "a": 1, "b": [2, 3] }),
    };
    let mut one = std::io::Cursor::new(Vec::new());
    let mut two = std::io::Cursor::new(Vec::new());
    write_envelope(&mut one, &env).await.unwrap();
    write_envelope(&mut two, &env).await.unwrap();
    assert_eq!(one.into_inner(), two.into_inner());
}

// ── Full streaming exchange on one buffer ─────────────────────────────────────

#[tokio::test]
async fn a_whole_stream_decodes_frame_by_frame() {
    let frames = [
        Envelope::StreamStart { task_id: "t".into() },
        Envelope::Progress { data: json!(1) },
        Envelope::Progress { data: json!(2) },
        Envelope::StreamEnd,
    ];
    let mut buf = std::io::Cursor::new(Vec::new());
    for f in &frames {
        write_envelope(&mut buf, f).await.unwrap();
    }
    let bytes = buf.into_inner();
    let mut rd = bytes.as_slice();
    for f in &frames {
        assert_eq!(&read_envelope(&mut rd).await.unwrap().unwrap(), f);
    }
    assert!(read_envelope(&mut rd).await.unwrap().is_none());
}
