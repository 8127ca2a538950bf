#[cfg(test)]
mod base_tests {
    use crate::ie::InfoModel;
    use crate::{FieldValue, MessageBuffer};

    fn iana_model() -> InfoModel {
        let model = InfoModel::new();
        model.use_iana_default().unwrap();
        model
    }

    /// Template 256 {sourceIPv4Address, packetDeltaCount}, one record
    /// {10.1.2.3, 27}, export time 2013-06-21T14:00:03Z.
    const FLOW_MESSAGE: &str = concat!(
        "000a003000000000",
        "51c45c63",
        "00000001",
        "00020010010000020008000400020008",
        "01000010",
        "0a010203",
        "000000000000001b",
    );

    #[test]
    fn it_parses_a_known_ipfix_message() {
        let bytes = hex::decode(FLOW_MESSAGE).unwrap();

        let mut msg = MessageBuffer::with_model(iana_model());
        msg.from_bytes(&bytes).unwrap();
        assert_eq!(msg.odid(), 1);
        assert_eq!(msg.setlist().len(), 2);

        let records: Result<Vec<_>, _> = msg.namedict_iterator().collect();
        let records = records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0]["sourceIPv4Address"],
            FieldValue::Ip4Addr("10.1.2.3".parse().unwrap())
        );
        assert_eq!(records[0]["packetDeltaCount"], FieldValue::Unsigned(27));
    }

    #[test]
    fn it_serializes_decoded_records_as_json() {
        let bytes = hex::decode(FLOW_MESSAGE).unwrap();

        let mut msg = MessageBuffer::with_model(iana_model());
        msg.from_bytes(&bytes).unwrap();
        let records: Result<Vec<_>, _> = msg.namedict_iterator().collect();
        let json = serde_json::to_value(records.unwrap()).unwrap();
        assert_eq!(json[0]["packetDeltaCount"], serde_json::json!(27));
        assert_eq!(json[0]["sourceIPv4Address"], serde_json::json!("10.1.2.3"));
    }

    #[test]
    fn it_reuses_learned_templates_across_messages() {
        // the second message carries only data for template 256
        let data_only = concat!(
            "000a002000000001",
            "51c45c64",
            "00000001",
            "01000010",
            "c0000201",
            "0000000000000063",
        );

        let mut msg = MessageBuffer::with_model(iana_model());
        msg.from_bytes(&hex::decode(FLOW_MESSAGE).unwrap()).unwrap();
        assert_eq!(msg.namedict_iterator().count(), 1);

        msg.from_bytes(&hex::decode(data_only).unwrap()).unwrap();
        let records: Result<Vec<_>, _> = msg.namedict_iterator().collect();
        let records = records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["packetDeltaCount"], FieldValue::Unsigned(99));
        assert_eq!(msg.next_sequence(1, 0), 2);
    }

    #[test]
    fn it_skips_data_sets_without_templates() {
        // data set 300 was never described by a template
        let hex = concat!(
            "000a002000000000",
            "51c45c63",
            "00000001",
            "012c0010",
            "0a010203",
            "000000000000001b",
        );
        let mut msg = MessageBuffer::with_model(iana_model());
        msg.from_bytes(&hex::decode(hex).unwrap()).unwrap();
        let records: Vec<_> = msg.namedict_iterator().collect();
        assert!(records.is_empty());
        assert_eq!(msg.stats().missing_templates, 1);
    }
}
