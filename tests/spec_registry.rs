use ipfix_codec::ie::{self, InfoModel, reverse_spec};
use ipfix_codec::{IpfixType, SpecError, VARLEN};

use pretty_assertions::assert_eq;

#[test]
fn loads_spec_files_from_disk() {
    let path = std::env::temp_dir().join(format!(
        "ipfix_codec_specfile_{}.iespec",
        std::process::id()
    ));
    std::fs::write(
        &path,
        "myCounter(9999/1)<unsigned64>[8]\n\nmyLabel(9999/2)<string>[65535]\n",
    )
    .unwrap();

    let model = InfoModel::new();
    model.use_specfile(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let counter = model.for_spec("myCounter").unwrap();
    assert_eq!((counter.pen, counter.num), (9999, 1));
    assert_eq!(counter.ietype, IpfixType::Unsigned64);
    let label = model.for_spec("(9999/2)").unwrap();
    assert_eq!(label.name, "myLabel");
    assert_eq!(label.length, VARLEN);
}

#[test]
fn reports_the_line_of_a_bad_specfile_entry() {
    let path = std::env::temp_dir().join(format!(
        "ipfix_codec_badspec_{}.iespec",
        std::process::id()
    ));
    std::fs::write(&path, "good(9999/1)<unsigned8>[1]\nbad(9999/2)<nosuch>[1]\n").unwrap();

    let model = InfoModel::new();
    let err = model.use_specfile(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, SpecError::AtLine { line: 2, .. }));
    // the good line before the failure is registered
    assert!(model.for_spec("good").is_ok());
}

#[test]
fn clear_empties_a_model() {
    let model = InfoModel::new();
    model.use_iana_default().unwrap();
    assert!(!model.is_empty());
    model.clear();
    assert!(model.is_empty());
    assert!(matches!(
        model.for_spec("octetDeltaCount"),
        Err(SpecError::NeedType(_))
    ));
}

#[test]
fn default_model_backs_the_free_functions() {
    ie::use_iana_default().unwrap();
    let a = ie::for_spec("octetDeltaCount").unwrap();
    let b = ie::default_model().for_spec("octetDeltaCount").unwrap();
    assert_eq!(a, b);

    let list = ie::spec_list(["sourceIPv4Address", "destinationIPv4Address"]).unwrap();
    assert_eq!(list.len(), 2);

    let synth = ie::for_template_entry(4242, 9, 3).unwrap();
    assert_eq!(synth.name, "_ipfix_4242_9");
}

#[test]
fn reverse_transform_matches_rfc5103() {
    assert_eq!(
        reverse_spec("packetDeltaCount(2)<unsigned64>[8]").unwrap(),
        "reversePacketDeltaCount(29305/2)<unsigned64>[8]"
    );
    // enterprise IEs keep their pen and flip bit 0x4000
    assert_eq!(
        reverse_spec("x(100/5)<unsigned8>[1]").unwrap(),
        "reverseX(100/16389)<unsigned8>[1]"
    );
    assert!(reverse_spec("").is_err());
}

#[test]
fn bundled_reverse_registry_lines_up_with_iana() {
    let model = InfoModel::new();
    model.use_iana_default().unwrap();
    model.use_5103_default().unwrap();

    let fwd = model.for_spec("octetDeltaCount").unwrap();
    let rev = model.for_spec("reverseOctetDeltaCount").unwrap();
    assert_eq!(rev.pen, 29305);
    assert_eq!(rev.num, fwd.num);
    assert_eq!(rev.ietype, fwd.ietype);
    assert_eq!(rev.length, fwd.length);
}
