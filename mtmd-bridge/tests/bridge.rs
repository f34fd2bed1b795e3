mod common;

use common::{
    declared_tokens, solid_bitmap, FakeEngine, FakeModel, Fixture, BOS, COUNT_MISMATCH, MARKER,
};
use mtmd_bridge::error::EVAL_UNFILLED_PLACEHOLDERS;
use mtmd_bridge::pixels::extract_rgb;
use mtmd_bridge::{Bridge, BridgeError, Handle, ProjectorParams, TurnState};

fn prompt() -> String {
    format!("USER: {MARKER} describe this ASSISTANT:")
}

#[test]
fn rgba_image_becomes_packed_rgb() {
    let image = image::RgbaImage::from_fn(3, 2, |x, y| {
        let v = u8::try_from(10 * y + x).unwrap();
        image::Rgba([v, v + 100, v + 200, 7])
    });

    let bitmap = extract_rgb(&image).unwrap();
    assert_eq!(bitmap.data().len(), 3 * 2 * 3);
    for y in 0..2usize {
        for x in 0..3usize {
            let i = (y * 3 + x) * 3;
            let v = u8::try_from(10 * y + x).unwrap();
            assert_eq!(&bitmap.data()[i..i + 3], &[v, v + 100, v + 200]);
        }
    }
}

#[test]
fn one_marker_one_bitmap_tokenizes() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let image = image::RgbaImage::from_pixel(64, 48, image::Rgba([1, 2, 3, 255]));
    let bitmap = fx.bridge.bitmap_from_image(&image).unwrap();

    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    assert_eq!(fx.bridge.chunk_count(chunks), 3);
    assert_eq!(fx.bridge.chunk_state(chunks), Some(TurnState::Tokenized));

    // the image chunk stages one placeholder per declared token
    let batch = fx.bridge.new_batch(512).unwrap();
    let added = fx.bridge.add_chunk_to_batch(batch, chunks, 1, 0).unwrap();
    let (nx, ny) = declared_tokens(64, 48);
    assert_eq!(added, nx * ny);
}

#[test]
fn bitmap_without_marker_is_rejected() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));

    let err = fx
        .bridge
        .tokenize(fx.projector, "no marker here", &[bitmap])
        .unwrap_err();
    assert!(matches!(err, BridgeError::Tokenization { code } if code == COUNT_MISMATCH));
    assert_eq!(err.code(), Some(COUNT_MISMATCH));

    // the bitmap is read, not consumed
    assert!(fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).is_ok());
}

#[test]
fn add_chunk_index_bounds() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    let count = fx.bridge.chunk_count(chunks) as usize;
    let batch = fx.bridge.new_batch(512).unwrap();

    let err = fx.bridge.add_chunk_to_batch(batch, chunks, count, 0).unwrap_err();
    assert!(matches!(err, BridgeError::Index { index, len } if index == count && len == count));
    assert_eq!(fx.bridge.batch_len(batch).unwrap(), 0);

    // last chunk is " describe this ASSISTANT:" => three words
    let added = fx.bridge.add_chunk_to_batch(batch, chunks, count - 1, 7).unwrap();
    assert_eq!(added, 3);
    assert_eq!(fx.bridge.batch_len(batch).unwrap(), 3);
}

#[test]
fn chunk_that_does_not_fit_leaves_batch_untouched() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(64, 64, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    let batch = fx.bridge.new_batch(8).unwrap();

    fx.bridge.add_chunk_to_batch(batch, chunks, 0, 0).unwrap();
    let before = fx.bridge.batch_len(batch).unwrap();
    let err = fx.bridge.add_chunk_to_batch(batch, chunks, 1, 3).unwrap_err();
    assert!(matches!(err, BridgeError::BatchFull { capacity: 8 }));
    assert_eq!(fx.bridge.batch_len(batch).unwrap(), before);
}

#[test]
fn decode_batch_refuses_placeholders() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    let batch = fx.bridge.new_batch(512).unwrap();

    let text = fx.bridge.add_chunk_to_batch(batch, chunks, 0, 0).unwrap();
    fx.bridge
        .add_chunk_to_batch(batch, chunks, 1, i32::try_from(text).unwrap())
        .unwrap();
    let err = fx.bridge.decode_batch(fx.context_handle, batch).unwrap_err();
    assert_eq!(err.code(), Some(EVAL_UNFILLED_PLACEHOLDERS));
    assert!(fx.context.calls().is_empty());
}

#[test]
fn decode_batch_submits_text_and_clears() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    let batch = fx.bridge.new_batch(512).unwrap();

    fx.bridge.add_chunk_to_batch(batch, chunks, 0, 0).unwrap();
    fx.bridge.decode_batch(fx.context_handle, batch).unwrap();
    assert_eq!(fx.bridge.batch_len(batch).unwrap(), 0);

    let decoded = fx.context.decoded_tokens();
    let positions: Vec<_> = decoded.iter().map(|&(_, pos)| pos).collect();
    assert_eq!(positions, [0, 1]);
    assert_eq!(decoded[0].0, BOS);

    let err = fx.bridge.decode_batch(fx.context_handle, batch).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));
}

#[test]
fn eval_advances_and_consumes_the_turn() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 48, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();

    let (nx, ny) = declared_tokens(32, 48);
    let expected = 2 + i32::try_from(nx * ny).unwrap() + 3;
    let pos = fx
        .bridge
        .eval_chunks(fx.projector, fx.context_handle, chunks, 10, 4)
        .unwrap();
    assert_eq!(pos, 10 + expected);
    assert_eq!(fx.bridge.chunk_state(chunks), Some(TurnState::Evaluated));

    let err = fx
        .bridge
        .eval_chunks(fx.projector, fx.context_handle, chunks, pos, 4)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState { .. }));
}

#[test]
fn failed_eval_marks_turn_failed() {
    let engine = FakeEngine {
        fail_encode: Some(5),
        ..FakeEngine::default()
    };
    let fx = Fixture::new(engine, 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();

    let err = fx
        .bridge
        .eval_chunks(fx.projector, fx.context_handle, chunks, 0, 64)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Eval { code: 5 }));
    assert_eq!(fx.bridge.chunk_state(chunks), Some(TurnState::Failed));

    let err = fx
        .bridge
        .eval_chunks(fx.projector, fx.context_handle, chunks, 0, 64)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState { state: "failed" }));
}

#[test]
fn eval_rejects_bad_arguments() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();

    for (position, capacity) in [(-1, 64), (0, 0)] {
        let err = fx
            .bridge
            .eval_chunks(fx.projector, fx.context_handle, chunks, position, capacity)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }
    assert_eq!(fx.bridge.chunk_state(chunks), Some(TurnState::Tokenized));
}

#[test]
fn double_release_is_a_noop() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let chunks = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    let batch = fx.bridge.new_batch(16).unwrap();

    assert!(fx.bridge.release_bitmap(bitmap));
    assert!(!fx.bridge.release_bitmap(bitmap));
    assert!(fx.bridge.release_chunks(chunks));
    assert!(!fx.bridge.release_chunks(chunks));
    assert!(fx.bridge.release_batch(batch));
    assert!(!fx.bridge.release_batch(batch));
    assert!(fx.bridge.release_projector(fx.projector));
    assert!(!fx.bridge.release_projector(fx.projector));
    assert!(fx.bridge.release_context(fx.context_handle));
    assert!(!fx.bridge.release_context(fx.context_handle));
    assert!(fx.bridge.release_model(fx.model));
    assert!(!fx.bridge.release_model(fx.model));

    assert_eq!(fx.bridge.chunk_count(chunks), 0);
    assert_eq!(fx.bridge.chunk_state(chunks), None);
}

#[test]
fn released_and_foreign_handles_are_invalid() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    fx.bridge.release_bitmap(bitmap);

    let err = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidHandle { kind: "bitmap", .. }));

    // a projector handle is not a context handle
    let batch = fx.bridge.new_batch(16).unwrap();
    let err = fx.bridge.decode_batch(fx.projector, batch).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidHandle { kind: "context", .. }));
}

#[test]
fn projector_outlives_released_model() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    fx.bridge.release_model(fx.model);

    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(16, 16, 9));
    assert!(fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).is_ok());
    assert!(matches!(
        fx.bridge.load_projector(fx.model, "mmproj.gguf"),
        Err(BridgeError::InvalidHandle { kind: "model", .. })
    ));
}

#[test]
fn load_projector_reports_bad_weights() {
    let bridge = Bridge::new(FakeEngine::default(), ProjectorParams::default());
    let model = bridge.register_model(FakeModel::default());

    let err = bridge.load_projector(model, "weights.bin").unwrap_err();
    assert!(matches!(err, BridgeError::Load { .. }));
    assert!(Handle::from_raw(0).is_none());
}

#[test]
fn zero_capacity_batch_is_rejected() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    assert!(matches!(
        fx.bridge.new_batch(0),
        Err(BridgeError::InvalidArgument(_))
    ));
}

#[test]
fn text_only_follow_up_turn_continues_the_conversation() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let bitmap = fx.bridge.insert_bitmap(solid_bitmap(32, 32, 9));
    let first = fx.bridge.tokenize(fx.projector, &prompt(), &[bitmap]).unwrap();
    let pos = fx
        .bridge
        .eval_chunks(fx.projector, fx.context_handle, first, 0, 64)
        .unwrap();

    let follow_up = fx.bridge.tokenize(fx.projector, "and answer briefly", &[]).unwrap();
    assert_eq!(fx.bridge.chunk_count(follow_up), 1);
    let end = fx
        .bridge
        .eval_chunks(fx.projector, fx.context_handle, follow_up, pos, 64)
        .unwrap();
    // BOS plus three words
    assert_eq!(end, pos + 4);

    // a marker still needs its bitmap
    let err = fx.bridge.tokenize(fx.projector, &prompt(), &[]).unwrap_err();
    assert_eq!(err.code(), Some(COUNT_MISMATCH));
}

#[test]
fn add_chunk_rejects_unusable_offsets() {
    let fx = Fixture::new(FakeEngine::default(), 4096);
    let chunks = fx.bridge.tokenize(fx.projector, "one two three", &[]).unwrap();
    let batch = fx.bridge.new_batch(16).unwrap();

    for offset in [-1, i32::MAX - 2] {
        let err = fx.bridge.add_chunk_to_batch(batch, chunks, 0, offset).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }
    assert_eq!(fx.bridge.batch_len(batch).unwrap(), 0);
}
