mod common;

use bwflash_core::{
    flasher::{self, Callbacks, Error, Options},
    leqi,
    link::sim::LeqiDeviceSim,
    FirmwareKind,
};
use common::{leqi_image, FakeClock, ProgressRecorder};
use std::time::Duration;

fn options_with_progress(progress: &ProgressRecorder) -> Options {
    let mut options = Options::new("sim");
    options.callbacks = Callbacks::new().on_progress(progress.record());
    options
}

#[test]
fn derived_size_covers_the_padding_run() {
    assert_eq!(leqi::derive_fw_size(&leqi_image()), 0x1F80);
}

#[test]
fn happy_path_sends_63_chunks() {
    let fw = leqi_image();
    let progress = ProgressRecorder::new();
    let mut flasher = flasher::create_from_image(&fw, options_with_progress(&progress)).unwrap();
    assert_eq!(flasher.kind(), FirmwareKind::Leqi);

    let mut sim = LeqiDeviceSim::new();
    let mut clock = FakeClock::new();
    flasher.run_with(&mut sim, &mut clock).unwrap();

    assert_eq!(sim.start_frames(), 1);
    assert_eq!(sim.data_frames(), 63);
    assert_eq!(sim.end_frames(), 1);
    progress.assert_monotonic_to_100();

    // 44 ms between chunks plus the 690 ms settle delay were honored.
    assert!(clock.slept.contains(&Duration::from_millis(44)));
    assert!(clock.slept.contains(&Duration::from_millis(690)));
}

#[test]
fn end_command_retries_until_the_tenth_attempt() {
    let fw = leqi_image();
    let progress = ProgressRecorder::new();
    let mut flasher = flasher::create_from_image(&fw, options_with_progress(&progress)).unwrap();

    let mut sim = LeqiDeviceSim::new().with_silent_end_attempts(9);
    let mut clock = FakeClock::new();
    flasher.run_with(&mut sim, &mut clock).unwrap();

    assert_eq!(sim.end_frames(), 10);
    progress.assert_monotonic_to_100();
}

#[test]
fn silent_device_fails_the_end_phase() {
    let fw = leqi_image();
    let mut flasher = flasher::create_from_image(&fw, Options::new("sim")).unwrap();

    let mut sim = LeqiDeviceSim::new().with_silent_end_attempts(leqi::MAX_END_ATTEMPTS + 1);
    let mut clock = FakeClock::new();
    let err = flasher.run_with(&mut sim, &mut clock).unwrap_err();
    assert!(matches!(err, Error::EndFailed));
    assert_eq!(sim.end_frames(), leqi::MAX_END_ATTEMPTS);
}

#[test]
fn rejected_chunks_fail_the_data_phase() {
    let fw = leqi_image();
    let mut flasher = flasher::create_from_image(&fw, Options::new("sim")).unwrap();

    let mut sim = LeqiDeviceSim::new().with_rejected_data();
    let mut clock = FakeClock::new();
    let err = flasher.run_with(&mut sim, &mut clock).unwrap_err();
    assert!(matches!(err, Error::ChunkRejected { count: 63 }));
    // The end command was never attempted.
    assert_eq!(sim.end_frames(), 0);
}

#[test]
fn final_chunk_is_padded_to_a_full_frame() {
    // fw_size just past a chunk boundary: the last data frame still carries
    // a full 128-byte body.
    let mut raw = leqi_image().to_vec();
    raw.truncate(0x1F44);
    let fw: std::sync::Arc<[u8]> = raw.into();
    assert_eq!(leqi::derive_fw_size(&fw), 0x1F80);

    let mut flasher = flasher::create_from_image(&fw, Options::new("sim")).unwrap();
    let mut sim = LeqiDeviceSim::new();
    let mut clock = FakeClock::new();
    flasher.run_with(&mut sim, &mut clock).unwrap();
    assert_eq!(sim.data_frames(), 63);
}
