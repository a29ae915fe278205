// crates/matinee-player/tests/playback.rs
//
// End-to-end pipeline tests against a real media file. They need an actual
// container to demux, so they look one up in MATINEE_TEST_MEDIA and skip
// (successfully) when it is not set. Any short file with an audio and/or
// video stream works, e.g. one produced with:
//
//   ffmpeg -f lavfi -i testsrc=duration=10:size=320x240:rate=25 \
//          -f lavfi -i sine=frequency=440:duration=10 sample.mkv

use std::time::{Duration, Instant};

use matinee_player::{
    Area, AudioFormatRequest, PixelFormat, Plane, PlayerState, Source, StreamKind,
    VideoFormatRequest, VideoTexture,
};

fn test_source() -> Option<Source> {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::var("MATINEE_TEST_MEDIA").ok()?;
    Some(Source::from_url(&path).expect("test media should open"))
}

struct CountingTexture {
    uploads: usize,
    last_area: Area,
}

impl VideoTexture for CountingTexture {
    fn upload(&mut self, area: Area, planes: &[Plane<'_>], _format: PixelFormat) {
        assert!(!planes.is_empty());
        assert!(!area.is_empty());
        self.uploads += 1;
        self.last_area = area;
    }
}

#[test]
fn test_audio_drain_and_eof_stop() {
    let Some(source) = test_source() else { return };
    let Some(audio_index) = source.best_stream(StreamKind::Audio) else { return };

    let mut player = matinee_player::Player::new(
        &source,
        None,
        Some(audio_index),
        None,
        VideoFormatRequest::default(),
        AudioFormatRequest::default(),
        0,
        0,
    )
    .expect("player should build");

    let format = player.info().audio.expect("audio lane").format;
    player.play();

    let mut total = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    let deadline = Instant::now() + Duration::from_secs_f64(source.duration() + 5.0);
    while player.state() == PlayerState::Playing {
        let got = player.audio_data(0, &mut chunk);
        total += got;
        if got == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(Instant::now() < deadline, "playback did not finish in time");
    }

    // Delivered roughly the whole stream's PCM (timing slop allowed: the
    // clock gates delivery in real time).
    let expected = format.bytes_per_second() as f64 * source.duration();
    assert!(total as f64 > expected * 0.5, "only {total} bytes delivered");
}

#[test]
fn test_seek_repositions_pipeline() {
    let Some(source) = test_source() else { return };
    let duration = source.duration();
    if duration < 4.0 {
        return;
    }
    let video = source.best_stream(StreamKind::Video);
    let audio = source.best_stream(StreamKind::Audio);
    if video.is_none() && audio.is_none() {
        return;
    }

    let mut player = matinee_player::Player::new(
        &source,
        video,
        audio,
        None,
        VideoFormatRequest::default(),
        AudioFormatRequest::default(),
        320,
        240,
    )
    .unwrap();
    player.play();

    let target = duration / 2.0;
    player.seek(target).expect("seek should succeed");

    // Position reflects the seek promptly and buffers refill.
    let deadline = Instant::now() + Duration::from_millis(500);
    let mut refilled = false;
    let mut texture = CountingTexture { uploads: 0, last_area: Area::default() };
    while Instant::now() < deadline {
        player.video_frame(&mut texture);
        let mut sink = [0u8; 4096];
        player.audio_data(0, &mut sink);
        let video_filled = player
            .video_buffer_state()
            .map_or(video.is_none(), |s| s.input_length > 0 || s.output_length > 0);
        let audio_filled = player
            .audio_buffer_state()
            .map_or(audio.is_none(), |s| s.input_length > 0 || s.output_length > 0);
        if video_filled && audio_filled {
            refilled = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(refilled, "buffers did not refill after seek");
    let position = player.position();
    assert!(
        (position - target).abs() < 1.0,
        "position {position} too far from seek target {target}"
    );
}

#[test]
fn test_pause_preserves_position() {
    let Some(source) = test_source() else { return };
    let Some(audio_index) = source.best_stream(StreamKind::Audio) else { return };
    if source.duration() < 3.0 {
        return;
    }

    let mut player = matinee_player::Player::new(
        &source,
        None,
        Some(audio_index),
        None,
        VideoFormatRequest::default(),
        AudioFormatRequest::default(),
        0,
        0,
    )
    .unwrap();
    player.play();

    let mut chunk = vec![0u8; 16 * 1024];
    let play_until = Instant::now() + Duration::from_millis(1200);
    while Instant::now() < play_until {
        if player.audio_data(0, &mut chunk) == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    player.pause();
    let paused_at = player.position();
    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(player.position(), paused_at, "position moved while paused");

    player.play();
    let resume_until = Instant::now() + Duration::from_millis(500);
    while Instant::now() < resume_until {
        if player.audio_data(0, &mut chunk) == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    let after = player.position();
    // The pause gap is swallowed: position advances by play time only.
    assert!(after >= paused_at);
    assert!(after - paused_at < 0.8, "pause time leaked into position");
}

#[test]
fn test_close_with_loaded_buffers() {
    let Some(source) = test_source() else { return };
    let video = source.best_stream(StreamKind::Video);
    let audio = source.best_stream(StreamKind::Audio);
    if video.is_none() && audio.is_none() {
        return;
    }

    let mut player = matinee_player::Player::new(
        &source,
        video,
        audio,
        None,
        VideoFormatRequest::default(),
        AudioFormatRequest::default(),
        320,
        240,
    )
    .unwrap();
    player.play();
    // Let every queue load up, then tear down without draining: close must
    // not deadlock on blocked workers.
    player.wait_buffer_fill_rate(Some(50), None, Some(50), None, Duration::from_secs(2));
    player.close();
    assert_eq!(player.state(), PlayerState::Closed);
}

#[test]
fn test_buffer_fill_rate_reports_progress() {
    let Some(source) = test_source() else { return };
    let Some(audio_index) = source.best_stream(StreamKind::Audio) else { return };

    let mut player = matinee_player::Player::new(
        &source,
        None,
        Some(audio_index),
        None,
        VideoFormatRequest::default(),
        AudioFormatRequest::default(),
        0,
        0,
    )
    .unwrap();
    // Workers run from creation; the input ring should see packets without
    // play() being called.
    assert!(player.wait_buffer_fill_rate(
        None,
        Some(10),
        None,
        None,
        Duration::from_secs(2)
    ));
    let state = player.audio_buffer_state().unwrap();
    assert!(state.output_length > 0);
    assert!(state.output_capacity >= state.output_length);
    drop(player);
}
