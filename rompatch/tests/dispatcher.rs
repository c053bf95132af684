//! Dispatcher behavior: magic probing, console-header handling, and
//! validation policy.

use rombuf::RomBuf;
use rompatch::{apply, create, identify, parse, ApplyOptions, FormatTag, PatchError};

#[test]
fn magic_probing() {
    assert_eq!(identify(b"PATCHEOF"), Some(FormatTag::Ips));
    assert_eq!(identify(b"UPS1"), Some(FormatTag::Ups));
    assert_eq!(identify(b"BPS1"), Some(FormatTag::Bps));
    assert_eq!(identify(b"PPF30junk"), Some(FormatTag::Ppf));
    assert_eq!(identify(b"NINJA2"), Some(FormatTag::Rup));
    assert_eq!(identify(b"PMSR"), Some(FormatTag::Pmsr));
    assert_eq!(identify(&[0xD6, 0xC3, 0xC4, 0x00]), Some(FormatTag::Vcdiff));
    assert_eq!(identify(b"GARBAGE"), None);
    assert_eq!(identify(b""), None);
}

#[test]
fn aps_magic_conflict_resolves_to_the_longer_match() {
    // "APS10" is the N64 container; a bare "APS1" prefix with any other
    // fifth byte is the GBA one.
    assert_eq!(identify(b"APS10\x01\x00"), Some(FormatTag::ApsN64));
    assert_eq!(identify(b"APS1\x00\x00\x01\x00"), Some(FormatTag::ApsGba));
}

#[test]
fn unknown_container_is_unsupported_format() {
    assert!(matches!(
        parse(b"\x00\x01\x02\x03\x04\x05"),
        Err(PatchError::UnsupportedFormat)
    ));
}

#[test]
fn ebp_reports_its_own_tag() {
    let source = RomBuf::from_bytes(vec![0u8; 4]);
    let modified = RomBuf::from_bytes(vec![1u8; 4]);
    let patch = create(&source, &modified, FormatTag::Ebp, Some(r#"{"a":1}"#)).unwrap();
    assert_eq!(patch.format(), FormatTag::Ebp);

    let reparsed = parse(rompatch::export(&patch, None).unwrap().as_bytes()).unwrap();
    assert_eq!(reparsed.format(), FormatTag::Ebp);
}

#[test]
fn remove_header_splits_and_reassembles() {
    // A headered iNES dump: 16 bytes of header, 2 KiB of body.
    let mut header = vec![0x4E, 0x45, 0x53, 0x1A];
    header.resize(16, 0);
    let body = vec![0xAB; 2048];

    let mut modified_body = body.clone();
    modified_body[100] = 0xCD;

    let patch = create(
        &RomBuf::from_bytes(body.clone()),
        &RomBuf::from_bytes(modified_body.clone()),
        FormatTag::Ips,
        None,
    )
    .unwrap();

    let mut dump = header.clone();
    dump.extend_from_slice(&body);
    let source = RomBuf::from_bytes(dump).named("game.nes");

    let options = ApplyOptions {
        remove_header: true,
        ..Default::default()
    };
    let out = apply(&patch, &source, &options).unwrap();

    assert_eq!(&out.as_bytes()[..16], &header[..]);
    assert_eq!(&out.as_bytes()[16..], &modified_body[..]);
}

#[test]
fn remove_header_is_skipped_for_misaligned_dumps() {
    // 16 + 1000 bytes: not a whole number of 1 KiB banks, so the
    // header split does not trigger and the patch sees the whole file.
    let source = RomBuf::from_bytes(vec![0u8; 1016]).named("game.nes");
    let modified = RomBuf::from_bytes(vec![1u8; 1016]);
    let patch = create(&source, &modified, FormatTag::Ips, None).unwrap();

    let options = ApplyOptions {
        remove_header: true,
        ..Default::default()
    };
    let out = apply(&patch, &source, &options).unwrap();
    assert_eq!(out.as_bytes(), modified.as_bytes());
}

#[test]
fn add_header_synthesizes_and_strips() {
    // Patch built against a headered dump, but the user's copy is bare.
    let mut headered = vec![0u8; 16];
    headered.extend_from_slice(&[0xAB; 2048]);
    let mut headered_modified = headered.clone();
    headered_modified[16 + 100] = 0xCD;

    let patch = create(
        &RomBuf::from_bytes(headered),
        &RomBuf::from_bytes(headered_modified.clone()),
        FormatTag::Ips,
        None,
    )
    .unwrap();

    let bare = RomBuf::from_bytes(vec![0xAB; 2048]).named("game.nes");
    let options = ApplyOptions {
        add_header: true,
        ..Default::default()
    };
    let out = apply(&patch, &bare, &options).unwrap();
    assert_eq!(out.as_bytes(), &headered_modified[16..]);
}

#[test]
fn require_validation_gates_apply() {
    let source = RomBuf::from_bytes(vec![1, 2, 3, 4]);
    let modified = RomBuf::from_bytes(vec![4, 3, 2, 1]);
    let patch = create(&source, &modified, FormatTag::Ups, None).unwrap();

    let wrong = RomBuf::from_bytes(vec![9, 9, 9, 9]);
    assert!(!rompatch::validate_source(&patch, &wrong, 0));

    let strict = ApplyOptions {
        require_validation: true,
        ..Default::default()
    };
    assert!(matches!(
        apply(&patch, &wrong, &strict),
        Err(PatchError::ValidationFailed { .. })
    ));

    // Without validation the XOR still runs, but the target checksum
    // catches the bad output.
    assert!(matches!(
        apply(&patch, &wrong, &ApplyOptions::default()),
        Err(PatchError::TargetChecksumMismatch { .. })
    ));
}

#[test]
fn vcdiff_create_is_unsupported() {
    let a = RomBuf::from_bytes(vec![1, 2, 3]);
    let b = RomBuf::from_bytes(vec![3, 2, 1]);
    assert!(matches!(
        create(&a, &b, FormatTag::Vcdiff, None),
        Err(PatchError::UnsupportedFeature { .. })
    ));
}
