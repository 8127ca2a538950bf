use criterion::{Criterion, criterion_group, criterion_main};
use ipfix_codec::ie::InfoModel;
use ipfix_codec::{FieldValue, MessageBuffer, Template};
use std::hint::black_box;
use std::net::Ipv4Addr;

fn flow_message(model: &InfoModel) -> Vec<u8> {
    let ies = model
        .spec_list(["sourceIPv4Address", "packetDeltaCount"])
        .unwrap();
    let tmpl = Template::from_ies(256, ies).unwrap();

    let mut msg = MessageBuffer::with_model(model.clone());
    msg.begin_export(1).unwrap();
    msg.add_template(tmpl, true).unwrap();
    msg.export_ensure_set(256).unwrap();
    for i in 0..100u32 {
        msg.export_record(&[
            FieldValue::Ip4Addr(Ipv4Addr::from(0x0a00_0000 + i)),
            FieldValue::Unsigned(u64::from(i)),
        ])
        .unwrap();
    }
    msg.to_bytes().unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let model = InfoModel::new();
    model.use_iana_default().unwrap();

    c.bench_function("encode 100 records", |b| {
        b.iter(|| flow_message(black_box(&model)))
    });

    let bytes = flow_message(&model);
    c.bench_function("decode 100 records", |b| {
        let mut msg = MessageBuffer::with_model(model.clone());
        b.iter(|| {
            msg.from_bytes(black_box(&bytes)).unwrap();
            let mut count = 0;
            for rec in msg.namedict_iterator() {
                black_box(rec.unwrap());
                count += 1;
            }
            assert_eq!(count, 100);
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
