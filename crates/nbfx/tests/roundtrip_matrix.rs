use nbfx::{
    ArrayValues, BinaryDecoder, BinaryEncoder, DateTime, Decimal, Dictionaries, Guid, NodeKind,
    StringTable, TimeSpan,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Flattened decode, with attribute values and content materialized as text.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String, String, Vec<(String, String)>),
    End(String, String),
    Text(String),
    Comment(String),
}

fn drain(decoder: &mut BinaryDecoder<'_>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match decoder.read().expect("decode") {
            NodeKind::EndOfFile => return events,
            NodeKind::StartElement => {
                let attrs = decoder
                    .attributes()
                    .iter()
                    .map(|a| {
                        (
                            a.local_name
                                .as_text(decoder.source())
                                .expect("attr name")
                                .into_owned(),
                            a.value
                                .to_text(decoder.source())
                                .expect("attr value")
                                .into_owned(),
                        )
                    })
                    .collect();
                events.push(Event::Start(
                    decoder.prefix().expect("prefix").into_owned(),
                    decoder.local_name().expect("name").into_owned(),
                    attrs,
                ));
            }
            NodeKind::EndElement => events.push(Event::End(
                decoder.prefix().expect("prefix").into_owned(),
                decoder.local_name().expect("name").into_owned(),
            )),
            NodeKind::Text | NodeKind::Whitespace => events.push(Event::Text(
                decoder
                    .value()
                    .to_text(decoder.source())
                    .expect("text")
                    .into_owned(),
            )),
            NodeKind::Comment => events.push(Event::Comment(
                decoder
                    .value()
                    .to_text(decoder.source())
                    .expect("comment")
                    .into_owned(),
            )),
            other => panic!("unexpected node kind {other:?}"),
        }
    }
}

/// Writes a small random tree and returns the expected flattened events.
fn write_random_tree(
    rng: &mut StdRng,
    enc: &mut BinaryEncoder,
    names: &[&str],
    depth: usize,
) -> Vec<Event> {
    let mut events = Vec::new();
    let name = names[rng.gen_range(0..names.len())];
    let prefix = if rng.gen_bool(0.3) { "p" } else { "" };
    enc.write_start_element(prefix, name).expect("start");

    let mut attrs = Vec::new();
    for _ in 0..rng.gen_range(0..3usize) {
        let attr_name = names[rng.gen_range(0..names.len())];
        if attrs.iter().any(|(n, _)| *n == attr_name) {
            continue;
        }
        let value = format!("v{}", rng.gen_range(0..100));
        enc.write_start_attribute("", attr_name).expect("attr");
        enc.write_text(&value).expect("attr text");
        enc.write_end_attribute().expect("end attr");
        attrs.push((attr_name.to_string(), value));
    }
    events.push(Event::Start(prefix.to_string(), name.to_string(), attrs));

    for _ in 0..rng.gen_range(0..3usize) {
        if depth < 3 && rng.gen_bool(0.4) {
            events.extend(write_random_tree(rng, enc, names, depth + 1));
        } else {
            let n: i64 = rng.gen_range(-1000..1000);
            enc.write_int64(n).expect("int");
            events.push(Event::Text(n.to_string()));
        }
    }

    enc.write_end_element().expect("end");
    events.push(Event::End(prefix.to_string(), name.to_string()));
    events
}

#[test]
fn random_document_roundtrip_matrix() {
    let names = ["alpha", "beta", "gamma", "delta", "x"];
    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut enc = BinaryEncoder::new();
        let expected = write_random_tree(&mut rng, &mut enc, &names, 0);
        let bytes = enc.finish().expect("finish");
        let mut dec = BinaryDecoder::from_buffer(&bytes);
        assert_eq!(drain(&mut dec), expected, "seed {seed}");
    }
}

#[test]
fn random_roundtrip_with_static_dictionary() {
    let names = ["Envelope", "Header", "Body", "Action", "To"];
    let statics = StringTable::from_strings(names);
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut enc = BinaryEncoder::new().with_static_dictionary(statics.clone());
        let expected = write_random_tree(&mut rng, &mut enc, &names, 0);
        let bytes = enc.finish().expect("finish");
        let mut dec = BinaryDecoder::from_buffer(&bytes)
            .with_dictionaries(Dictionaries::with_statics(statics.clone()));
        assert_eq!(drain(&mut dec), expected, "seed {seed}");
    }
}

#[test]
fn typed_scalar_text_images_roundtrip() {
    let guid: Guid = "fe43a801-9f42-4d22-b1a3-000102030405".parse().expect("guid");
    let decimal: Decimal = "1099.5000".parse().expect("decimal");
    let mut enc = BinaryEncoder::new();
    enc.write_start_element("", "row").expect("start");
    enc.write_guid(guid).expect("guid");
    enc.write_decimal(decimal).expect("decimal");
    enc.write_timespan(TimeSpan::from_seconds(3661)).expect("ts");
    enc.write_datetime(DateTime::from_ymd_hms(1999, 12, 31, 23, 59, 59))
        .expect("dt");
    enc.write_end_element().expect("end");
    let bytes = enc.finish().expect("finish");

    let mut dec = BinaryDecoder::from_buffer(&bytes);
    let events = drain(&mut dec);
    assert_eq!(
        events,
        vec![
            Event::Start("".into(), "row".into(), vec![]),
            Event::Text("fe43a801-9f42-4d22-b1a3-000102030405".into()),
            Event::Text("1099.5000".into()),
            Event::Text("PT1H1M1S".into()),
            Event::Text("1999-12-31T23:59:59".into()),
            Event::End("".into(), "row".into()),
        ]
    );
}

#[test]
fn array_matrix_every_scalar_kind() {
    let decimals = [Decimal::from_i64(1), Decimal::from_i64(-2)];
    let datetimes = [
        DateTime::from_ymd_hms(2001, 1, 1, 0, 0, 0),
        DateTime::from_ymd_hms(2002, 2, 2, 0, 0, 0),
    ];
    let timespans = [TimeSpan::from_seconds(1), TimeSpan::from_seconds(-1)];
    let guids = [
        Guid::from_bytes([0u8; 16]),
        Guid::from_bytes([0xffu8; 16]),
    ];
    let cases: Vec<(ArrayValues<'_>, usize)> = vec![
        (ArrayValues::Bool(&[true, false, true]), 3),
        (ArrayValues::Int16(&[-5, 5]), 2),
        (ArrayValues::Int32(&[1, 2, 3, 4]), 4),
        (ArrayValues::Int64(&[i64::MIN, i64::MAX]), 2),
        (ArrayValues::Float(&[0.5, -0.5]), 2),
        (ArrayValues::Double(&[1.25, 2.5]), 2),
        (ArrayValues::Decimal(&decimals), 2),
        (ArrayValues::DateTime(&datetimes), 2),
        (ArrayValues::TimeSpan(&timespans), 2),
        (ArrayValues::Guid(&guids), 2),
    ];
    for (values, count) in cases {
        let mut enc = BinaryEncoder::new();
        enc.write_array("", "item", values).expect("array");
        let bytes = enc.finish().expect("finish");
        let mut dec = BinaryDecoder::from_buffer(&bytes);
        let mut seen = 0;
        loop {
            match dec.read().expect("decode") {
                NodeKind::EndOfFile => break,
                NodeKind::StartElement => {
                    assert_eq!(dec.local_name().expect("name"), "item");
                }
                NodeKind::Text => {
                    // Every entry materializes as text without error.
                    dec.value().to_text(dec.source()).expect("text");
                    seen += 1;
                }
                NodeKind::EndElement => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, count);
    }
}

#[test]
fn random_base64_payload_roundtrip() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = rng.gen_range(0..500usize);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let mut enc = BinaryEncoder::new();
        enc.write_start_element("", "blob").expect("start");
        enc.write_base64(&payload).expect("base64");
        enc.write_end_element().expect("end");
        let bytes = enc.finish().expect("finish");

        let mut dec = BinaryDecoder::from_buffer(&bytes);
        assert_eq!(dec.read().expect("read"), NodeKind::StartElement);
        let mut data = Vec::new();
        loop {
            match dec.read().expect("read") {
                NodeKind::Text => {
                    data.extend(dec.value().to_bytes(dec.source()).expect("bytes"))
                }
                NodeKind::EndElement => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(data, payload, "seed {seed}");
    }
}
