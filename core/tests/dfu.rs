mod common;

use bwflash_core::{
    flasher::{self, Callbacks, CancelToken, Error, Options},
    link::sim::DfuDeviceSim,
    FirmwareKind,
};
use common::{dfu_image, FakeClock, ProgressRecorder};
use std::sync::{Arc, Mutex};

fn options_with_progress(progress: &ProgressRecorder) -> Options {
    let mut options = Options::new("sim");
    options.callbacks = Callbacks::new().on_progress(progress.record());
    options
}

#[test]
fn happy_path_flashes_to_completion() {
    let fw = dfu_image();
    let progress = ProgressRecorder::new();
    let logs = Arc::new(Mutex::new(Vec::new()));

    let mut options = Options::new("sim");
    let log_sink = Arc::clone(&logs);
    options.callbacks = Callbacks::new()
        .on_progress(progress.record())
        .on_log(move |message| log_sink.lock().unwrap().push(message.to_owned()));

    let mut flasher = flasher::create_from_image(&fw, options).unwrap();
    assert_eq!(flasher.kind(), FirmwareKind::Dfu);

    let mut sim = DfuDeviceSim::new(&fw);
    let mut clock = FakeClock::new();
    flasher.run_with(&mut sim, &mut clock).unwrap();

    progress.assert_monotonic_to_100();
    // 0x22000 bytes => 68 packets of 16 chunks.
    assert_eq!(sim.chunks_seen(), 68 * 16);
    assert_eq!(sim.packets_seen(), 68);
    let logs = logs.lock().unwrap();
    assert!(logs.iter().any(|line| line.contains("foobarfoobar1337")));
}

#[test]
fn auth_mismatch_fails_in_ble_rand() {
    let fw = dfu_image();
    let progress = ProgressRecorder::new();
    let mut flasher = flasher::create_from_image(&fw, options_with_progress(&progress)).unwrap();

    let mut sim = DfuDeviceSim::new(&fw).with_ble_key([0; 16]);
    let mut clock = FakeClock::new();
    let err = flasher.run_with(&mut sim, &mut clock).unwrap_err();
    assert!(matches!(err, Error::AuthMismatch));

    // Nothing was streamed yet.
    assert_eq!(sim.chunks_seen(), 0);
    assert!(progress.values().iter().all(|&percent| percent == 0));
}

#[test]
fn chunk_nak_fails_with_crc_fail() {
    let fw = dfu_image();
    let progress = ProgressRecorder::new();
    let mut flasher = flasher::create_from_image(&fw, options_with_progress(&progress)).unwrap();

    let mut sim = DfuDeviceSim::new(&fw).with_chunk_nak();
    let mut clock = FakeClock::new();
    let err = flasher.run_with(&mut sim, &mut clock).unwrap_err();
    assert!(matches!(err, Error::CrcFail));

    // The NAK hit the very first chunk: no packet was ever committed.
    assert_eq!(sim.chunks_seen(), 1);
    assert!(progress.values().iter().all(|&percent| percent == 0));
}

#[test]
fn duplicated_signing_pattern_is_invalid() {
    // Signature-classified image whose signing pattern occurs twice.
    let mut fw = vec![0x33; 0x22000];
    fw[0x800..0x808].copy_from_slice(b"DEPRD5C\0");
    fw[0x17080..0x17082].copy_from_slice(&[0x63, 0x7C]);
    fw[0x18000..0x18002].copy_from_slice(&[0x63, 0x7C]);
    let fw: Arc<[u8]> = Arc::from(fw);

    let err = flasher::create_from_image(&fw, Options::new("sim")).unwrap_err();
    assert!(matches!(err, Error::InvalidFirmware));
}

#[test]
fn unknown_firmware_is_unsupported() {
    let fw: Arc<[u8]> = Arc::from(vec![0xC4; 0x2000]);
    let err = flasher::create_from_image(&fw, Options::new("sim")).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedFirmware(FirmwareKind::Unknown)
    ));
}

#[test]
fn test_connection_reaches_init() {
    let fw = dfu_image();
    let progress = ProgressRecorder::new();
    let mut options = options_with_progress(&progress);
    options.simulation = true;
    let mut flasher = flasher::create_from_image(&fw, options).unwrap();

    flasher.test_connection().unwrap();
    assert_eq!(progress.values().last(), Some(&100));
}

#[test]
fn cancellation_stops_before_any_io() {
    let fw = dfu_image();
    let cancel = CancelToken::new();
    let mut options = Options::new("sim");
    options.cancel = cancel.clone();
    let mut flasher = flasher::create_from_image(&fw, options).unwrap();

    cancel.cancel();
    let mut sim = DfuDeviceSim::new(&fw);
    let mut clock = FakeClock::new();
    let err = flasher.run_with(&mut sim, &mut clock).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(sim.chunks_seen(), 0);
}
